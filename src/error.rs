//! binlog2sql 에러 타입

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdcError {
    /// 스트림 시작 전에 발견되는 설정 오류 (치명적)
    #[error("설정 에러: {0}")]
    ConfigurationError(String),

    /// StatementBuilder까지 도달한 알 수 없는 이벤트 형태 (치명적)
    #[error("스트림 무결성 에러: {0}")]
    StreamIntegrityError(String),

    /// 개별 SQL 실행 실패 (복구 가능, 다음 문장으로 계속 진행)
    #[error("SQL 실행 에러: {0}")]
    SinkExecutionError(String),

    /// 롤백 파일 생성 실패 등 자원 에러 (치명적)
    #[error("자원 에러: {0}")]
    ResourceError(String),

    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl CdcError {
    /// 스트림을 중단시켜야 하는 에러인지 여부
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CdcError::SinkExecutionError(_))
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

impl From<mysql_async::Error> for CdcError {
    fn from(err: mysql_async::Error) -> Self {
        match err {
            mysql_async::Error::Server(e) => CdcError::QueryError(e.to_string()),
            other => CdcError::ConnectionError(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_error_is_recoverable() {
        assert!(!CdcError::SinkExecutionError("duplicate key".to_string()).is_fatal());
        assert!(CdcError::ConfigurationError("start_file".to_string()).is_fatal());
        assert!(CdcError::ResourceError("rollback".to_string()).is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: CdcError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, CdcError::IoError(msg) if msg.contains("gone")));
    }
}
