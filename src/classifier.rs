//! 이벤트 분류기
//!
//! DDL 억제 여부는 호출자의 정책이므로 여기서는 형태만 판별합니다.

use crate::events::{EventPayload, ReplicationEvent};
use serde::{Deserialize, Serialize};

/// 이벤트 분류 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    DdlQuery,
    RowInsert,
    RowUpdate,
    RowDelete,
    TxBegin,
    /// COMMIT, 로테이션, 포맷 설명 이벤트
    TxEndOrRotate,
    Other,
}

impl EventKind {
    pub fn is_row(&self) -> bool {
        matches!(self, EventKind::RowInsert | EventKind::RowUpdate | EventKind::RowDelete)
    }

    /// 오프셋 기록에서 제외되는 스트림 제어 이벤트인지 여부
    pub fn is_stream_control(&self) -> bool {
        matches!(self, EventKind::TxEndOrRotate)
    }
}

pub fn classify(event: &ReplicationEvent) -> EventKind {
    match &event.payload {
        EventPayload::Query(q) => match q.query.as_slice() {
            b"BEGIN" => EventKind::TxBegin,
            b"COMMIT" => EventKind::TxEndOrRotate,
            _ => EventKind::DdlQuery,
        },
        EventPayload::Rotate(_) | EventPayload::FormatDescription => EventKind::TxEndOrRotate,
        EventPayload::WriteRows(_) => EventKind::RowInsert,
        EventPayload::UpdateRows(_) => EventKind::RowUpdate,
        EventPayload::DeleteRows(_) => EventKind::RowDelete,
        EventPayload::Xid | EventPayload::Other(_) => EventKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{QueryEventData, RotateEventData, RowsEventData, TableRef};

    fn event(payload: EventPayload) -> ReplicationEvent {
        ReplicationEvent::new(Some(1_700_000_000), "mysql-bin.000001", 200, payload)
    }

    #[test]
    fn test_transaction_markers() {
        let begin = event(EventPayload::Query(QueryEventData::new("test", "BEGIN")));
        let commit = event(EventPayload::Query(QueryEventData::new("test", "COMMIT")));
        assert_eq!(classify(&begin), EventKind::TxBegin);
        assert_eq!(classify(&commit), EventKind::TxEndOrRotate);
    }

    #[test]
    fn test_other_queries_are_ddl() {
        let ddl = event(EventPayload::Query(QueryEventData::new("test", "CREATE TABLE t (id INT)")));
        assert_eq!(classify(&ddl), EventKind::DdlQuery);

        // 소문자 begin은 마커가 아님
        let lower = event(EventPayload::Query(QueryEventData::new("test", "begin")));
        assert_eq!(classify(&lower), EventKind::DdlQuery);
    }

    #[test]
    fn test_stream_control_events() {
        let rotate = event(EventPayload::Rotate(RotateEventData {
            next_binlog_name: "mysql-bin.000002".to_string(),
            position: 4,
        }));
        assert_eq!(classify(&rotate), EventKind::TxEndOrRotate);
        assert_eq!(classify(&event(EventPayload::FormatDescription)), EventKind::TxEndOrRotate);
        assert!(classify(&rotate).is_stream_control());
    }

    #[test]
    fn test_row_events() {
        let data = RowsEventData {
            table: TableRef::new("s", "t"),
            rows: Vec::new(),
        };
        assert_eq!(classify(&event(EventPayload::WriteRows(data.clone()))), EventKind::RowInsert);
        assert_eq!(classify(&event(EventPayload::UpdateRows(data.clone()))), EventKind::RowUpdate);
        assert_eq!(classify(&event(EventPayload::DeleteRows(data))), EventKind::RowDelete);
        assert_eq!(classify(&event(EventPayload::Xid)), EventKind::Other);
    }
}
