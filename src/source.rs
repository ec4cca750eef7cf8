//! 복제 소스 / 테이블 메타데이터 인터페이스
//!
//! 실제 binlog 디코딩은 이 트레이트를 구현하는 쪽(mysql_async 기반
//! `BinlogClient` 등)이 담당합니다.

use crate::error::Result;
use crate::events::{ReplicationEvent, TableRef};
use crate::offset::BinlogPosition;
use async_trait::async_trait;

/// 스키마 / 테이블 허용 목록
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaFilter {
    pub only_schemas: Vec<String>,
    pub only_tables: Vec<String>,
}

impl SchemaFilter {
    pub fn new(only_schemas: Vec<String>, only_tables: Vec<String>) -> Self {
        SchemaFilter {
            only_schemas,
            only_tables,
        }
    }

    /// 빈 목록은 전체 허용. 스키마/테이블 정보가 없는 이벤트는 통과합니다.
    pub fn matches(&self, schema: Option<&str>, table: Option<&str>) -> bool {
        if let Some(schema) = schema {
            if !self.only_schemas.is_empty() && !self.only_schemas.iter().any(|s| s == schema) {
                return false;
            }
        }
        if let Some(table) = table {
            if !self.only_tables.is_empty() && !self.only_tables.iter().any(|t| t == table) {
                return false;
            }
        }
        true
    }

    pub fn matches_event(&self, event: &ReplicationEvent) -> bool {
        self.matches(event.schema(), event.table())
    }
}

/// 복제 스트림 요청
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub start: BinlogPosition,
    pub server_id: u32,
    pub filter: SchemaFilter,
}

/// (file, offset) 순으로 증가하는 이벤트 스트림
#[async_trait]
pub trait EventStream: Send {
    /// 다음 이벤트. 스트림이 끝나면 None
    async fn next_event(&mut self) -> Result<Option<ReplicationEvent>>;

    async fn close(&mut self) -> Result<()>;
}

/// 테이블 메타데이터 조회 (no_pk 처리에만 사용)
#[async_trait]
pub trait TableMetadataProvider: Send {
    async fn primary_key(&mut self, table: &TableRef) -> Result<Option<String>>;
}

/// 복제 원본 서버
#[async_trait]
pub trait ReplicationServer: TableMetadataProvider {
    /// 현재 로그 끝 위치 (SHOW BINARY LOG STATUS)
    async fn binlog_status(&mut self) -> Result<BinlogPosition>;

    /// 서버가 알고 있는 binlog 파일 목록
    async fn binary_logs(&mut self) -> Result<Vec<String>>;

    /// 서버 인스턴스 id (없으면 None)
    async fn server_id(&mut self) -> Result<Option<u32>>;

    async fn open_stream(&mut self, request: StreamRequest) -> Result<Box<dyn EventStream>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_accepts_everything() {
        let filter = SchemaFilter::default();
        assert!(filter.matches(Some("any"), Some("table")));
        assert!(filter.matches(None, None));
    }

    #[test]
    fn test_schema_and_table_lists() {
        let filter = SchemaFilter::new(vec!["user_service".to_string()], vec!["users".to_string()]);
        assert!(filter.matches(Some("user_service"), Some("users")));
        assert!(!filter.matches(Some("billing"), Some("users")));
        assert!(!filter.matches(Some("user_service"), Some("orders")));
        // DDL에는 테이블 정보가 없음
        assert!(filter.matches(Some("user_service"), None));
    }
}
