//! MySQL Binlog 클라이언트
//!
//! mysql_async의 binlog 스트림에서 이벤트를 받아 `ReplicationEvent`로 변환합니다.
//! 행 이미지의 컬럼명은 binlog 메타데이터에 있으면 그것을, 없으면
//! INFORMATION_SCHEMA 컬럼 순서를 사용합니다 (binlog_row_image=FULL 필요).

use crate::connection::{SchemaCache, TableSchema};
use crate::error::{CdcError, Result};
use crate::events::{
    CellValue, EventPayload, QueryEventData, ReplicationEvent, RotateEventData, RowChange, RowImage,
    RowsEventData, TableRef,
};
use crate::source::{EventStream, SchemaFilter, StreamRequest};
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::StreamExt;
use mysql_async::binlog::events::{EventData, RowsEventData as RawRowsEvent};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::consts::ColumnType;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, Pool, Value};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowsKind {
    Write,
    Update,
    Delete,
}

/// Binlog 클라이언트
pub struct BinlogClient {
    stream: Option<BinlogStream>,
    /// 컬럼 메타데이터 조회용 별도 연결
    conn: Conn,
    schemas: SchemaCache,
    filter: SchemaFilter,
    current_file: String,
    event_count: u64,
}

impl BinlogClient {
    /// 요청 위치부터 binlog 스트리밍 시작. `schemas`는 메타데이터 조회 쪽과 공유하는 캐시
    pub async fn connect(pool: Pool, schemas: SchemaCache, request: StreamRequest) -> Result<Self> {
        info!(
            "Starting binlog streaming from {} (server_id={})",
            request.start, request.server_id
        );

        let conn = pool.get_conn().await?;
        let replication = pool.get_conn().await?;
        let stream = replication
            .get_binlog_stream(
                BinlogStreamRequest::new(request.server_id)
                    .with_filename(request.start.filename.as_bytes())
                    .with_pos(request.start.position),
            )
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to open binlog stream: {}", e)))?;

        Ok(BinlogClient {
            stream: Some(stream),
            conn,
            schemas,
            filter: request.filter,
            current_file: request.start.filename,
            event_count: 0,
        })
    }

    async fn decode_rows(&mut self, rows: &RawRowsEvent<'_>) -> Result<EventPayload> {
        let kind = match rows {
            RawRowsEvent::WriteRowsEvent(_) => RowsKind::Write,
            RawRowsEvent::UpdateRowsEvent(_) | RawRowsEvent::PartialUpdateRowsEvent(_) => RowsKind::Update,
            RawRowsEvent::DeleteRowsEvent(_) => RowsKind::Delete,
            _ => return Ok(EventPayload::Other("ROWS_EVENT_V1".to_string())),
        };

        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| CdcError::StreamIntegrityError("binlog 스트림이 이미 닫혔습니다".to_string()))?;
        let table = {
            let tme = stream.get_tme(rows.table_id()).ok_or_else(|| missing_table_map(rows.table_id()))?;
            TableRef::new(tme.database_name(), tme.table_name())
        };

        if !self.filter.matches(Some(&table.schema), Some(&table.table)) {
            return Ok(EventPayload::Other(format!("filtered {}.{}", table.schema, table.table)));
        }

        let schema = self.schemas.get(&mut self.conn, &table).await?;

        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| CdcError::StreamIntegrityError("binlog 스트림이 이미 닫혔습니다".to_string()))?;
        let tme = stream.get_tme(rows.table_id()).ok_or_else(|| missing_table_map(rows.table_id()))?;

        let mut changes = Vec::new();
        for row in rows.rows(tme) {
            let (before, after) = row.map_err(|e| {
                CdcError::StreamIntegrityError(format!("{}.{}: 행 디코딩 실패: {}", table.schema, table.table, e))
            })?;
            let before = before.map(|r| row_image(r, &schema)).transpose()?;
            let after = after.map(|r| row_image(r, &schema)).transpose()?;

            let change = match (kind, before, after) {
                (RowsKind::Write, None, Some(values)) | (RowsKind::Delete, Some(values), None) => {
                    RowChange::Values(values)
                }
                (RowsKind::Update, Some(before), Some(after)) => RowChange::Update { before, after },
                _ => {
                    return Err(CdcError::StreamIntegrityError(format!(
                        "{}.{}: {:?} 이벤트의 행 이미지가 올바르지 않습니다",
                        table.schema, table.table, kind
                    )))
                }
            };
            changes.push(change);
        }

        let data = RowsEventData { table, rows: changes };
        Ok(match kind {
            RowsKind::Write => EventPayload::WriteRows(data),
            RowsKind::Update => EventPayload::UpdateRows(data),
            RowsKind::Delete => EventPayload::DeleteRows(data),
        })
    }
}

fn missing_table_map(table_id: u64) -> CdcError {
    CdcError::StreamIntegrityError(format!("table_id {}에 대한 TABLE_MAP 이벤트가 없습니다", table_id))
}

fn row_image(row: BinlogRow, schema: &TableSchema) -> Result<RowImage> {
    let mut image = RowImage::new();
    for (index, column) in row.columns_ref().iter().enumerate() {
        let binlog_name = column.name_str();
        let name = if !binlog_name.is_empty() {
            binlog_name.into_owned()
        } else if let Some(name) = schema.column_name(index) {
            name.to_string()
        } else {
            format!("@{}", index + 1)
        };

        let value = match row.as_ref(index) {
            Some(value) => convert_value(value, column.column_type())?,
            None => CellValue::Null,
        };
        image.insert(name, value);
    }
    Ok(image)
}

fn convert_value(value: &BinlogValue<'_>, column_type: ColumnType) -> Result<CellValue> {
    match value {
        BinlogValue::Value(v) => Ok(convert_scalar(v, column_type)),
        BinlogValue::Jsonb(jsonb) => serde_json::Value::try_from(jsonb.clone())
            .map(CellValue::Json)
            .map_err(|e| CdcError::StreamIntegrityError(format!("JSON 컬럼 변환 실패: {:?}", e))),
        BinlogValue::JsonDiff(_) => Err(CdcError::StreamIntegrityError(
            "부분 JSON 업데이트는 지원하지 않습니다 (binlog_row_value_options 비활성화 필요)".to_string(),
        )),
    }
}

/// binlog 값 + 컬럼 타입 -> CellValue
pub fn convert_scalar(value: &Value, column_type: ColumnType) -> CellValue {
    match value {
        Value::NULL => CellValue::Null,
        Value::Int(v) => CellValue::Int(*v),
        Value::UInt(v) => CellValue::UInt(*v),
        Value::Float(v) => CellValue::Float(*v),
        Value::Double(v) => CellValue::Double(*v),
        Value::Bytes(bytes) => match column_type {
            ColumnType::MYSQL_TYPE_NEWDECIMAL | ColumnType::MYSQL_TYPE_DECIMAL => {
                CellValue::Decimal(String::from_utf8_lossy(bytes).into_owned())
            }
            _ => match String::from_utf8(bytes.clone()) {
                Ok(text) => CellValue::String(text),
                Err(_) => CellValue::Bytes(bytes.clone()),
            },
        },
        Value::Date(year, month, day, hour, minute, second, micros) => {
            let date = NaiveDate::from_ymd_opt(i32::from(*year), u32::from(*month), u32::from(*day));
            let is_date = matches!(column_type, ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE);
            match date {
                Some(date) if is_date => CellValue::Date(date),
                Some(date) => date
                    .and_hms_micro_opt(u32::from(*hour), u32::from(*minute), u32::from(*second), *micros)
                    .map(CellValue::DateTime)
                    .unwrap_or(CellValue::Null),
                // 0000-00-00 등 chrono로 표현할 수 없는 날짜는 문자열 그대로
                None if is_date => CellValue::String(format!("{:04}-{:02}-{:02}", year, month, day)),
                None => CellValue::String(format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    year, month, day, hour, minute, second
                )),
            }
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            CellValue::Time(format_time(*negative, *days, *hours, *minutes, *seconds, *micros))
        }
    }
}

/// MySQL TIME 표기 (`-838:59:59` 범위, 일 단위는 시간으로 합산)
fn format_time(negative: bool, days: u32, hours: u8, minutes: u8, seconds: u8, micros: u32) -> String {
    let sign = if negative { "-" } else { "" };
    let total_hours = u64::from(days) * 24 + u64::from(hours);
    if micros == 0 {
        format!("{}{:02}:{:02}:{:02}", sign, total_hours, minutes, seconds)
    } else {
        format!("{}{:02}:{:02}:{:02}.{:06}", sign, total_hours, minutes, seconds, micros)
    }
}

#[async_trait]
impl EventStream for BinlogClient {
    async fn next_event(&mut self) -> Result<Option<ReplicationEvent>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        let event = match stream.next().await {
            Some(event) => event?,
            None => {
                info!("Binlog streaming ended. Total events received: {}", self.event_count);
                return Ok(None);
            }
        };
        self.event_count += 1;

        let header = event.header();
        let timestamp = Some(header.timestamp());
        let log_pos = u64::from(header.log_pos());
        let data = event
            .read_data()
            .map_err(|e| CdcError::StreamIntegrityError(format!("이벤트 디코딩 실패 at {}: {}", log_pos, e)))?;

        let payload = match data {
            Some(EventData::RotateEvent(rotate)) => {
                self.current_file = rotate.name().into_owned();
                debug!("Rotated to {}:{}", self.current_file, rotate.position());
                return Ok(Some(ReplicationEvent::new(
                    timestamp,
                    self.current_file.clone(),
                    rotate.position(),
                    EventPayload::Rotate(RotateEventData {
                        next_binlog_name: self.current_file.clone(),
                        position: rotate.position(),
                    }),
                )));
            }
            Some(EventData::QueryEvent(query)) => {
                let data = QueryEventData::new(query.schema(), query.query_raw().to_vec());
                let text = data.query_text();
                if text != "BEGIN" && text != "COMMIT" {
                    self.schemas.invalidate_schema(&data.schema).await;
                }
                EventPayload::Query(data)
            }
            Some(EventData::FormatDescriptionEvent(_)) => EventPayload::FormatDescription,
            Some(EventData::XidEvent(_)) => EventPayload::Xid,
            Some(EventData::TableMapEvent(_)) => EventPayload::Other("TABLE_MAP_EVENT".to_string()),
            Some(EventData::RowsEvent(rows)) => self.decode_rows(&rows).await?,
            Some(_) => EventPayload::Other(format!("{:?}", header.event_type())),
            None => EventPayload::Other("UNKNOWN_EVENT".to_string()),
        };

        Ok(Some(ReplicationEvent::new(timestamp, self.current_file.clone(), log_pos, payload)))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.close().await?;
            info!("Binlog stream closed after {} events", self.event_count);
        }
        Ok(())
    }
}
