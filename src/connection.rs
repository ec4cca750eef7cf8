//! MySQL 데이터베이스 연결 관리

use crate::binlog_client::BinlogClient;
use crate::error::{CdcError, Result};
use crate::events::TableRef;
use crate::offset::BinlogPosition;
use crate::source::{EventStream, ReplicationServer, StreamRequest, TableMetadataProvider};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, Pool, Row};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// MySQL 연결 설정
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    /// 연결 수립 제한 시간 (초)
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            connect_timeout_secs: 30,
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    /// 롤백 파일명 등에 쓰는 `host.port`
    pub fn endpoint(&self) -> String {
        format!("{}.{}", self.hostname, self.port)
    }

    pub(crate) fn build_opts(&self) -> Result<Opts> {
        let connection_string = if let Some(ref db) = self.database {
            format!(
                "mysql://{}:{}@{}:{}/{}",
                self.username, self.password, self.hostname, self.port, db
            )
        } else {
            format!(
                "mysql://{}:{}@{}:{}",
                self.username, self.password, self.hostname, self.port
            )
        };

        connection_string
            .parse()
            .map_err(|_| CdcError::ConnectionError("Failed to parse connection string".to_string()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// 풀을 만들고 첫 연결을 제한 시간 안에 가져옴
    pub(crate) async fn open_pool(&self) -> Result<(Pool, Conn)> {
        let pool = Pool::new(self.build_opts()?);
        let conn = tokio::time::timeout(self.connect_timeout(), pool.get_conn())
            .await
            .map_err(|_| {
                CdcError::ConnectionError(format!(
                    "Timed out connecting to {}:{} after {}s",
                    self.hostname, self.port, self.connect_timeout_secs
                ))
            })?
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to {}:{}: {}", self.hostname, self.port, e)))?;
        Ok((pool, conn))
    }
}

/// 테이블 컬럼 정보
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub primary: bool,
}

/// INFORMATION_SCHEMA에서 읽은 테이블 구조
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<ColumnInfo>,
}

impl TableSchema {
    pub fn column_name(&self, index: usize) -> Option<&str> {
        self.columns.get(index).map(|c| c.name.as_str())
    }

    /// 단일 컬럼 기본 키. 복합 키나 키가 없는 테이블은 None
    pub fn primary_key(&self) -> Option<&str> {
        let mut keys = self.columns.iter().filter(|c| c.primary);
        match (keys.next(), keys.next()) {
            (Some(key), None) => Some(key.name.as_str()),
            _ => None,
        }
    }
}

/// 테이블 구조 캐시
///
/// 복제한 핸들은 같은 저장소를 가리킵니다. binlog 스트림이 DDL을 보고 지운
/// 항목은 메타데이터 조회(no_pk 기본 키) 쪽에서도 사라집니다.
#[derive(Debug, Clone, Default)]
pub struct SchemaCache {
    tables: Arc<Mutex<HashMap<TableRef, Arc<TableSchema>>>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        SchemaCache::default()
    }

    pub async fn get(&self, conn: &mut Conn, table: &TableRef) -> Result<Arc<TableSchema>> {
        if let Some(schema) = self.cached(table).await {
            return Ok(schema);
        }

        let schema = Arc::new(fetch_table_schema(conn, &table.schema, &table.table).await?);
        debug!(
            "Loaded metadata for {}.{} ({} columns)",
            table.schema,
            table.table,
            schema.columns.len()
        );
        self.store(table, schema.clone()).await;
        Ok(schema)
    }

    async fn cached(&self, table: &TableRef) -> Option<Arc<TableSchema>> {
        self.tables.lock().await.get(table).cloned()
    }

    async fn store(&self, table: &TableRef, schema: Arc<TableSchema>) {
        self.tables.lock().await.insert(table.clone(), schema);
    }

    /// DDL 이후 구조가 바뀌었을 수 있으므로 해당 스키마의 캐시 제거
    pub async fn invalidate_schema(&self, schema: &str) {
        self.tables.lock().await.retain(|table, _| table.schema != schema);
    }
}

/// 테이블 스키마 조회
pub async fn fetch_table_schema(conn: &mut Conn, database: &str, table: &str) -> Result<TableSchema> {
    let result: Vec<(String, String)> = conn
        .exec(
            "SELECT COLUMN_NAME, COLUMN_KEY \
             FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
             ORDER BY ORDINAL_POSITION",
            (database, table),
        )
        .await
        .map_err(|e| CdcError::QueryError(format!("Failed to query table schema: {}", e)))?;

    Ok(TableSchema {
        columns: result
            .into_iter()
            .map(|(name, column_key)| ColumnInfo {
                name,
                primary: column_key == "PRI",
            })
            .collect(),
    })
}

/// 원본 서버 연결
pub struct MySqlConnection {
    pool: Pool,
    conn: Conn,
    config: ConnectionConfig,
    schemas: SchemaCache,
}

impl MySqlConnection {
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        let (pool, conn) = config.open_pool().await?;
        info!("Connected to {}:{}", config.hostname, config.port);

        Ok(MySqlConnection {
            pool,
            conn,
            config,
            schemas: SchemaCache::new(),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// 현재 로그 끝 위치. 8.4 이전 서버는 SHOW MASTER STATUS로 재시도
    pub async fn get_binlog_status(&mut self) -> Result<BinlogPosition> {
        let rows: Vec<Row> = match self.conn.query("SHOW BINARY LOG STATUS").await {
            Ok(rows) => rows,
            Err(e) => {
                debug!("SHOW BINARY LOG STATUS failed ({}), falling back to SHOW MASTER STATUS", e);
                self.conn
                    .query("SHOW MASTER STATUS")
                    .await
                    .map_err(|e| CdcError::QueryError(format!("Failed to query binlog status: {}", e)))?
            }
        };

        let row = rows.first().ok_or_else(|| {
            CdcError::ConfigurationError("binlog가 활성화되어 있지 않습니다 (binlog status 없음)".to_string())
        })?;
        let file: Option<String> = row.get(0);
        let position: Option<u64> = row.get(1);
        match (file, position) {
            (Some(file), Some(position)) => Ok(BinlogPosition::new(file, position)),
            _ => Err(CdcError::QueryError("Unexpected binlog status row".to_string())),
        }
    }

    /// 서버가 보관 중인 binlog 파일 목록
    pub async fn get_binary_logs(&mut self) -> Result<Vec<String>> {
        let rows: Vec<Row> = self
            .conn
            .query("SHOW BINARY LOGS")
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query binary logs: {}", e)))?;

        Ok(rows.iter().filter_map(|row| row.get::<String, _>(0)).collect())
    }

    /// MySQL 서버 정보 조회
    pub async fn get_server_id(&mut self) -> Result<Option<u32>> {
        let result: Option<u32> = self
            .conn
            .query_first("SELECT @@server_id")
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query server_id: {}", e)))?;

        Ok(result.filter(|id| *id != 0))
    }

    /// 테이블 스키마 조회 (캐시)
    pub async fn get_table_schema(&mut self, table: &TableRef) -> Result<Arc<TableSchema>> {
        self.schemas.get(&mut self.conn, table).await
    }
}

#[async_trait]
impl TableMetadataProvider for MySqlConnection {
    async fn primary_key(&mut self, table: &TableRef) -> Result<Option<String>> {
        let schema = self.get_table_schema(table).await?;
        Ok(schema.primary_key().map(str::to_string))
    }
}

#[async_trait]
impl ReplicationServer for MySqlConnection {
    async fn binlog_status(&mut self) -> Result<BinlogPosition> {
        self.get_binlog_status().await
    }

    async fn binary_logs(&mut self) -> Result<Vec<String>> {
        self.get_binary_logs().await
    }

    async fn server_id(&mut self) -> Result<Option<u32>> {
        self.get_server_id().await
    }

    async fn open_stream(&mut self, request: StreamRequest) -> Result<Box<dyn EventStream>> {
        let client = BinlogClient::connect(self.pool.clone(), self.schemas.clone(), request).await?;
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, primary: bool) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            primary,
        }
    }

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, 3306);
        assert_eq!(config.endpoint(), "localhost.3306");
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_connection_config_new() {
        let config = ConnectionConfig::new("127.0.0.1", "root");
        assert_eq!(config.hostname, "127.0.0.1");
        assert_eq!(config.username, "root");
    }

    #[test]
    fn test_connection_config_from_json() {
        let config: ConnectionConfig =
            serde_json::from_str(r#"{ "hostname": "db.internal", "port": 3307, "password": "pw", "connect_timeout_secs": 5 }"#)
            .unwrap();
        assert_eq!(config.endpoint(), "db.internal.3307");
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.username, "root");
        assert!(config.build_opts().is_ok());
    }

    #[test]
    fn test_primary_key_detection() {
        let single = TableSchema {
            columns: vec![column("id", true), column("name", false)],
        };
        assert_eq!(single.primary_key(), Some("id"));
        assert_eq!(single.column_name(1), Some("name"));
        assert_eq!(single.column_name(2), None);

        let composite = TableSchema {
            columns: vec![column("a", true), column("b", true)],
        };
        assert_eq!(composite.primary_key(), None);

        assert_eq!(TableSchema::default().primary_key(), None);
    }

    #[tokio::test]
    async fn test_connect_times_out() {
        // 응답하지 않는 주소(TEST-NET-1)
        let mut config = ConnectionConfig::new("192.0.2.1", "root");
        config.connect_timeout_secs = 0;
        let err = config.open_pool().await.unwrap_err();
        assert!(matches!(err, CdcError::ConnectionError(_)));
    }

    #[tokio::test]
    async fn test_schema_cache_invalidation_is_shared() {
        let cache = SchemaCache::new();
        let stream_side = cache.clone();
        let users = TableRef::new("shop", "users");
        let orders = TableRef::new("billing", "orders");
        let schema = Arc::new(TableSchema {
            columns: vec![column("id", true)],
        });
        cache.store(&users, schema.clone()).await;
        cache.store(&orders, schema).await;

        // 스트림 쪽에서 DDL을 보고 지우면 조회 쪽에서도 사라짐
        stream_side.invalidate_schema("shop").await;

        assert!(cache.cached(&users).await.is_none());
        assert!(cache.cached(&orders).await.is_some());
    }
}
