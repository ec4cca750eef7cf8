//! 테스트용 메모리 기반 복제 서버 / 스트림 / 싱크

use crate::error::{CdcError, Result};
use crate::events::{
    CellValue, EventPayload, QueryEventData, ReplicationEvent, RotateEventData, RowChange, RowImage,
    RowsEventData, TableRef,
};
use crate::offset::BinlogPosition;
use crate::sink::SqlSink;
use crate::source::{EventStream, ReplicationServer, StreamRequest, TableMetadataProvider};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 2024-05-01 12:00:00 UTC
pub const TS: u32 = 1_714_564_800;

pub fn image(pairs: Vec<(&str, CellValue)>) -> RowImage {
    pairs.into_iter().collect()
}

fn rows_data(table: &TableRef, rows: Vec<RowChange>) -> RowsEventData {
    RowsEventData {
        table: table.clone(),
        rows,
    }
}

pub fn insert_event(file: &str, pos: u64, table: &TableRef, values: RowImage) -> ReplicationEvent {
    ReplicationEvent::new(
        Some(TS),
        file,
        pos,
        EventPayload::WriteRows(rows_data(table, vec![RowChange::Values(values)])),
    )
}

pub fn update_event(file: &str, pos: u64, table: &TableRef, before: RowImage, after: RowImage) -> ReplicationEvent {
    ReplicationEvent::new(
        Some(TS),
        file,
        pos,
        EventPayload::UpdateRows(rows_data(table, vec![RowChange::Update { before, after }])),
    )
}

pub fn delete_event(file: &str, pos: u64, table: &TableRef, values: RowImage) -> ReplicationEvent {
    ReplicationEvent::new(
        Some(TS),
        file,
        pos,
        EventPayload::DeleteRows(rows_data(table, vec![RowChange::Values(values)])),
    )
}

pub fn query_event(file: &str, pos: u64, schema: &str, sql: &str) -> ReplicationEvent {
    ReplicationEvent::new(Some(TS), file, pos, EventPayload::Query(QueryEventData::new(schema, sql)))
}

pub fn xid_event(file: &str, pos: u64) -> ReplicationEvent {
    ReplicationEvent::new(Some(TS), file, pos, EventPayload::Xid)
}

pub fn rotate_event(next_file: &str, pos: u64) -> ReplicationEvent {
    ReplicationEvent::new(
        Some(TS),
        next_file,
        pos,
        EventPayload::Rotate(RotateEventData {
            next_binlog_name: next_file.to_string(),
            position: pos,
        }),
    )
}

/// 미리 정해진 이벤트를 돌려주는 스트림
pub struct MockStream {
    events: VecDeque<ReplicationEvent>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl EventStream for MockStream {
    async fn next_event(&mut self) -> Result<Option<ReplicationEvent>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self.events.pop_front())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockServer {
    pub events: Vec<ReplicationEvent>,
    pub logs: Vec<String>,
    pub eof: BinlogPosition,
    pub server_id: Option<u32>,
    pub primary_keys: HashMap<TableRef, String>,
    pub last_request: Option<StreamRequest>,
    pub closed: Arc<AtomicBool>,
}

impl MockServer {
    pub fn new(logs: &[&str], events: Vec<ReplicationEvent>) -> Self {
        let last_log = logs.last().copied().unwrap_or_default();
        MockServer {
            events,
            logs: logs.iter().map(|s| s.to_string()).collect(),
            eof: BinlogPosition::new(last_log, 1_000_000),
            server_id: Some(1),
            primary_keys: HashMap::new(),
            last_request: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_primary_key(mut self, table: &TableRef, column: &str) -> Self {
        self.primary_keys.insert(table.clone(), column.to_string());
        self
    }

    pub fn stream_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TableMetadataProvider for MockServer {
    async fn primary_key(&mut self, table: &TableRef) -> Result<Option<String>> {
        Ok(self.primary_keys.get(table).cloned())
    }
}

#[async_trait]
impl ReplicationServer for MockServer {
    async fn binlog_status(&mut self) -> Result<BinlogPosition> {
        Ok(self.eof.clone())
    }

    async fn binary_logs(&mut self) -> Result<Vec<String>> {
        Ok(self.logs.clone())
    }

    async fn server_id(&mut self) -> Result<Option<u32>> {
        Ok(self.server_id)
    }

    async fn open_stream(&mut self, request: StreamRequest) -> Result<Box<dyn EventStream>> {
        // 서버처럼 요청 위치 이전 이벤트는 건너뜀
        let events = self
            .events
            .iter()
            .filter(|e| {
                e.log_file > request.start.filename
                    || (e.log_file == request.start.filename && e.log_pos > request.start.position)
            })
            .cloned()
            .collect();
        self.last_request = Some(request);
        Ok(Box::new(MockStream {
            events,
            closed: self.closed.clone(),
        }))
    }
}

/// 실행된 문장을 기록하는 싱크. `fail_on` 문자열을 포함한 문장은 실패합니다.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub executed: Vec<String>,
    pub commits: usize,
    pub fail_on: Vec<String>,
}

impl RecordingSink {
    pub fn failing_on(pattern: &str) -> Self {
        RecordingSink {
            fail_on: vec![pattern.to_string()],
            ..Default::default()
        }
    }
}

#[async_trait]
impl SqlSink for RecordingSink {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        if self.fail_on.iter().any(|p| sql.contains(p.as_str())) {
            return Err(CdcError::SinkExecutionError(format!("{}: injected failure", sql)));
        }
        self.executed.push(sql.to_string());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.commits += 1;
        Ok(())
    }
}
