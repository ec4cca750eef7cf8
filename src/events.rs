//! 복제 로그 이벤트 및 행 이미지 데이터 구조 정의
//!
//! 바이너리 로그 디코딩은 외부 복제 클라이언트가 담당하고,
//! 여기서는 필터링과 SQL 재구성에 필요한 형태만 정의합니다.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// 셀 값 (binlog 행 이미지의 스칼라 값)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    /// 정밀도를 잃지 않도록 문자열로 보관
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    /// SET 컬럼 값
    Set(Vec<String>),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Time(String),
    Json(serde_json::Value),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// SQL에 넣을 수 있는 형태로 정규화
    ///
    /// SET은 콤마로 이어 붙인 문자열로 바꿉니다. 바이트 문자열은 UTF-8로
    /// 읽을 수 있을 때만 텍스트가 되고, 아니면 바이트 그대로 남습니다.
    pub fn normalized(&self) -> CellValue {
        match self {
            CellValue::Set(items) => CellValue::String(items.join(",")),
            CellValue::Bytes(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => CellValue::String(text.to_string()),
                Err(_) => CellValue::Bytes(bytes.clone()),
            },
            other => other.clone(),
        }
    }
}

impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        CellValue::Int(v)
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        CellValue::String(v.to_string())
    }
}

impl From<String> for CellValue {
    fn from(v: String) -> Self {
        CellValue::String(v)
    }
}

/// 컬럼 순서를 보존하는 행 이미지 (column -> value)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowImage {
    columns: Vec<(String, CellValue)>,
}

impl RowImage {
    pub fn new() -> Self {
        RowImage::default()
    }

    /// 같은 컬럼이 이미 있으면 값을 덮어씁니다.
    pub fn insert(&mut self, column: impl Into<String>, value: CellValue) {
        let column = column.into();
        match self.columns.iter_mut().find(|(name, _)| *name == column) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn remove(&mut self, column: &str) -> Option<CellValue> {
        let idx = self.columns.iter().position(|(name, _)| name == column)?;
        Some(self.columns.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &CellValue> {
        self.columns.iter().map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, CellValue)> for RowImage {
    fn from_iter<I: IntoIterator<Item = (K, CellValue)>>(iter: I) -> Self {
        let mut image = RowImage::new();
        for (column, value) in iter {
            image.insert(column, value);
        }
        image
    }
}

/// 행 변경 레코드
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowChange {
    /// INSERT / DELETE: 단일 이미지
    Values(RowImage),
    /// UPDATE: 변경 전후 이미지
    Update { before: RowImage, after: RowImage },
}

/// 테이블 식별자
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        TableRef {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

/// ROWS 이벤트 데이터 (WRITE/UPDATE/DELETE 공통)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowsEventData {
    pub table: TableRef,
    pub rows: Vec<RowChange>,
}

/// 쿼리 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEventData {
    /// 기본 데이터베이스명 (없으면 빈 문자열)
    pub schema: String,
    /// 원본 쿼리 바이트
    pub query: Vec<u8>,
}

impl QueryEventData {
    pub fn new(schema: impl Into<String>, query: impl Into<Vec<u8>>) -> Self {
        QueryEventData {
            schema: schema.into(),
            query: query.into(),
        }
    }

    /// 바이트 쿼리를 텍스트로 디코딩
    pub fn query_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.query)
    }
}

/// 회전 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotateEventData {
    pub next_binlog_name: String,
    pub position: u64,
}

/// 이벤트 본문
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    Query(QueryEventData),
    Rotate(RotateEventData),
    FormatDescription,
    /// XID (트랜잭션 커밋)
    Xid,
    WriteRows(RowsEventData),
    UpdateRows(RowsEventData),
    DeleteRows(RowsEventData),
    /// 코어에서 다루지 않는 이벤트 (TABLE_MAP, GTID 등)
    Other(String),
}

/// 복제 스트림에서 읽은 이벤트
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationEvent {
    /// 이벤트 타임스탬프 (초 단위, 없을 수 있음)
    pub timestamp: Option<u32>,
    /// 현재 binlog 파일명
    pub log_file: String,
    /// 현재 스트림 위치 (다음 이벤트 시작 위치)
    pub log_pos: u64,
    pub payload: EventPayload,
}

impl ReplicationEvent {
    pub fn new(timestamp: Option<u32>, log_file: impl Into<String>, log_pos: u64, payload: EventPayload) -> Self {
        ReplicationEvent {
            timestamp,
            log_file: log_file.into(),
            log_pos,
            payload,
        }
    }

    /// 이벤트가 속한 스키마명
    pub fn schema(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Query(q) if !q.schema.is_empty() => Some(q.schema.as_str()),
            EventPayload::WriteRows(r) | EventPayload::UpdateRows(r) | EventPayload::DeleteRows(r) => {
                Some(r.table.schema.as_str())
            }
            _ => None,
        }
    }

    /// 이벤트가 속한 테이블명 (ROWS 이벤트만)
    pub fn table(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::WriteRows(r) | EventPayload::UpdateRows(r) | EventPayload::DeleteRows(r) => {
                Some(r.table.table.as_str())
            }
            _ => None,
        }
    }

    pub fn rows(&self) -> Option<&RowsEventData> {
        match &self.payload {
            EventPayload::WriteRows(r) | EventPayload::UpdateRows(r) | EventPayload::DeleteRows(r) => Some(r),
            _ => None,
        }
    }
}

/// 변경 연산 타입 (SQL 타입 허용 목록에 사용)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

impl OperationType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Some(OperationType::Insert),
            "UPDATE" => Some(OperationType::Update),
            "DELETE" => Some(OperationType::Delete),
            _ => None,
        }
    }

    pub fn all() -> Vec<OperationType> {
        vec![OperationType::Insert, OperationType::Update, OperationType::Delete]
    }
}
