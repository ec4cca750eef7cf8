//! MySQL binlog -> SQL 변환 (binlog2sql) 핵심 구현
//!
//! 이 라이브러리는 MySQL 바이너리 로그를 읽어 원본 SQL 또는 롤백 SQL을 생성합니다.
//! 주요 기능:
//! - 위치 / 시간 범위 필터링
//! - 행 이벤트 -> INSERT / UPDATE / DELETE 문장 생성
//! - 역방향(flashback) 롤백 SQL 생성
//! - 선언적 테이블 매핑

pub mod binlog_client;
pub mod classifier;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod flashback;
pub mod mapping;
pub mod offset;
pub mod range_filter;
pub mod sink;
pub mod source;
pub mod statement;
pub mod stream_driver;

#[cfg(test)]
pub(crate) mod testing;

pub use binlog_client::BinlogClient;
pub use config::Binlog2SqlConfig;
pub use connection::MySqlConnection;
pub use error::{CdcError, Result};
pub use events::{CellValue, ReplicationEvent, RowImage};
pub use offset::BinlogPosition;
pub use statement::{MapperRegistry, StatementBuilder};
pub use stream_driver::{RunSummary, StreamDriver};
