//! 생성된 SQL 출력 대상
//!
//! 대상 DB가 설정되지 않으면 stdout으로만 출력합니다.

use crate::connection::ConnectionConfig;
use crate::error::{CdcError, Result};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Pool};
use std::io::Write;
use tracing::{debug, info};

/// 문장 단위 실행기. 실행 실패는 `SinkExecutionError`로 돌려주며 스트림을 멈추지 않습니다.
#[async_trait]
pub trait SqlSink: Send {
    async fn execute(&mut self, sql: &str) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;
}

/// 표준 출력
#[derive(Debug, Default)]
pub struct StdoutSink;

#[async_trait]
impl SqlSink for StdoutSink {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        writeln!(out, "{}", sql)?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        std::io::stdout().flush()?;
        Ok(())
    }
}

/// 대상 MySQL 서버에 문장마다 실행 후 커밋
pub struct MySqlSink {
    pool: Pool,
    conn: Conn,
    /// 실행한 문장을 stdout에도 출력
    echo: bool,
}

impl MySqlSink {
    pub async fn connect(config: &ConnectionConfig, echo: bool) -> Result<Self> {
        let (pool, conn) = config.open_pool().await?;
        info!("Connected to destination {}:{}", config.hostname, config.port);

        Ok(MySqlSink { pool, conn, echo })
    }

    pub async fn disconnect(self) -> Result<()> {
        drop(self.conn);
        self.pool.disconnect().await?;
        Ok(())
    }
}

#[async_trait]
impl SqlSink for MySqlSink {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        if self.echo {
            println!("{}", sql);
        }
        debug!("Executing on destination: {}", sql);
        self.conn
            .query_drop(sql)
            .await
            .map_err(|e| CdcError::SinkExecutionError(format!("{}: {}", sql, e)))
    }

    async fn commit(&mut self) -> Result<()> {
        self.conn
            .query_drop("COMMIT")
            .await
            .map_err(|e| CdcError::SinkExecutionError(format!("COMMIT: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdout_sink_accepts_statements() {
        let mut sink = StdoutSink;
        tokio_test::block_on(async {
            sink.execute("SELECT 1;").await.unwrap();
            sink.commit().await.unwrap();
        });
    }

    #[test]
    fn test_sink_errors_are_recoverable() {
        let err = CdcError::SinkExecutionError("INSERT ...: duplicate key".to_string());
        assert!(!err.is_fatal());
    }
}
