//! 선언적 테이블 매핑
//!
//! 원본 테이블의 행 변경을 다른 채널(대상 DB)의 다른 테이블/컬럼 구조로 옮깁니다.
//! JSON 매핑 파일 예:
//!
//! ```json
//! {
//!   "tables": [{
//!     "source_schema": "shop",
//!     "source_table": "users",
//!     "destinations": [{
//!       "channel": "crm",
//!       "schema": "crm",
//!       "table": "customers",
//!       "key_column": "customer_id",
//!       "source_key": "id",
//!       "columns": [
//!         { "target": "customer_id", "from": "id" },
//!         { "target": "display_name", "from": "name" },
//!         { "target": "origin", "value": "shop" }
//!       ]
//!     }]
//!   }]
//! }
//! ```

use crate::error::{CdcError, Result};
use crate::events::{CellValue, RowImage, TableRef};
use crate::statement::{
    delete_statement, insert_statement, update_statement, MapperRegistry, RowMapper, StatementBatch,
};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MappingConfig {
    #[serde(default)]
    pub tables: Vec<TableMapping>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableMapping {
    /// 없으면 모든 스키마의 같은 이름 테이블
    #[serde(default)]
    pub source_schema: Option<String>,
    pub source_table: String,
    pub destinations: Vec<DestinationMapping>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationMapping {
    /// 없으면 대상 스키마명
    #[serde(default)]
    pub channel: Option<String>,
    pub schema: String,
    pub table: String,
    /// UPDATE/DELETE 조건에 쓰는 대상 키 컬럼
    pub key_column: String,
    /// 키 값을 읽을 원본 컬럼 (없으면 key_column과 같은 이름)
    #[serde(default)]
    pub source_key: Option<String>,
    pub columns: Vec<ColumnMapping>,
    #[serde(default = "enabled")]
    pub on_insert: bool,
    #[serde(default = "enabled")]
    pub on_update: bool,
    #[serde(default)]
    pub on_delete: bool,
}

fn enabled() -> bool {
    true
}

/// 대상 컬럼 하나. `from`(원본 컬럼)과 `value`(상수) 중 하나만 지정
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnMapping {
    pub target: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

impl MappingConfig {
    pub fn validate(&self) -> Result<()> {
        for table in &self.tables {
            if table.destinations.is_empty() {
                return Err(CdcError::ConfigurationError(format!(
                    "{}: 대상 매핑이 없습니다",
                    table.source_table
                )));
            }
            for dest in &table.destinations {
                dest.validate(&table.source_table)?;
            }
        }
        Ok(())
    }
}

impl DestinationMapping {
    fn validate(&self, source_table: &str) -> Result<()> {
        if self.columns.is_empty() {
            return Err(CdcError::ConfigurationError(format!(
                "{} -> {}.{}: 컬럼 매핑이 없습니다",
                source_table, self.schema, self.table
            )));
        }
        for column in &self.columns {
            match (&column.from, &column.value) {
                (Some(_), None) | (None, Some(_)) => {}
                _ => {
                    return Err(CdcError::ConfigurationError(format!(
                        "{} -> {}.{}.{}: from과 value 중 하나만 지정해야 합니다",
                        source_table, self.schema, self.table, column.target
                    )))
                }
            }
        }
        if !self.columns.iter().any(|c| c.target == self.key_column) {
            return Err(CdcError::ConfigurationError(format!(
                "{} -> {}.{}: 키 컬럼 {}이 컬럼 목록에 없습니다",
                source_table, self.schema, self.table, self.key_column
            )));
        }
        Ok(())
    }

    fn channel(&self) -> &str {
        self.channel.as_deref().unwrap_or(&self.schema)
    }

    fn target(&self) -> TableRef {
        TableRef::new(&self.schema, &self.table)
    }

    fn source_key(&self) -> &str {
        self.source_key.as_deref().unwrap_or(&self.key_column)
    }

    /// 원본 행 이미지를 대상 컬럼 구조로 변환
    fn project(&self, source: &TableRef, values: &RowImage) -> Result<RowImage> {
        let mut projected = RowImage::new();
        for column in &self.columns {
            let value = match (&column.from, &column.value) {
                (Some(from), _) => values.get(from).cloned().ok_or_else(|| {
                    CdcError::StreamIntegrityError(format!(
                        "{}.{}: 매핑에 필요한 컬럼 {}이 행에 없습니다",
                        source.schema, source.table, from
                    ))
                })?,
                (None, Some(constant)) => json_to_cell(constant),
                (None, None) => CellValue::Null,
            };
            projected.insert(&column.target, value);
        }
        Ok(projected)
    }

    fn key_filter(&self, source: &TableRef, values: &RowImage) -> Result<RowImage> {
        let key = values.get(self.source_key()).cloned().ok_or_else(|| {
            CdcError::StreamIntegrityError(format!(
                "{}.{}: 키 컬럼 {}이 행에 없습니다",
                source.schema,
                source.table,
                self.source_key()
            ))
        })?;
        let mut filter = RowImage::new();
        filter.insert(&self.key_column, key);
        Ok(filter)
    }
}

/// JSON 상수를 컬럼 값으로
pub fn json_to_cell(value: &serde_json::Value) -> CellValue {
    match value {
        serde_json::Value::Null => CellValue::Null,
        serde_json::Value::Bool(b) => CellValue::Int(i64::from(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                CellValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                CellValue::UInt(u)
            } else {
                CellValue::Double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => CellValue::String(s.clone()),
        other => CellValue::Json(other.clone()),
    }
}

/// 매핑 설정 하나(원본 테이블 하나)에 대한 RowMapper
#[derive(Debug, Clone)]
pub struct DeclarativeMapper {
    destinations: Vec<DestinationMapping>,
}

impl DeclarativeMapper {
    pub fn new(destinations: Vec<DestinationMapping>) -> Self {
        DeclarativeMapper { destinations }
    }
}

impl RowMapper for DeclarativeMapper {
    fn build_insert(&self, table: &TableRef, values: &RowImage) -> Result<StatementBatch> {
        let mut batch = StatementBatch::new();
        for dest in self.destinations.iter().filter(|d| d.on_insert) {
            let projected = dest.project(table, values)?;
            batch.push(dest.channel(), insert_statement(&dest.target(), &projected));
        }
        Ok(batch)
    }

    fn build_insert_without_key(&self, table: &TableRef, values: &RowImage, primary_key: &str) -> Result<StatementBatch> {
        let mut batch = StatementBatch::new();
        for dest in self.destinations.iter().filter(|d| d.on_insert) {
            let mut projected = dest.project(table, values)?;
            for column in dest.columns.iter().filter(|c| c.from.as_deref() == Some(primary_key)) {
                projected.remove(&column.target);
            }
            if projected.is_empty() {
                continue;
            }
            batch.push(dest.channel(), insert_statement(&dest.target(), &projected));
        }
        Ok(batch)
    }

    fn build_update(&self, table: &TableRef, before: &RowImage, after: &RowImage) -> Result<StatementBatch> {
        let mut batch = StatementBatch::new();
        for dest in self.destinations.iter().filter(|d| d.on_update) {
            let mut set = dest.project(table, after)?;
            set.remove(&dest.key_column);
            if set.is_empty() {
                continue;
            }
            let filter = dest.key_filter(table, before)?;
            batch.push(dest.channel(), update_statement(&dest.target(), &set, &filter)?);
        }
        Ok(batch)
    }

    fn build_delete(&self, table: &TableRef, values: &RowImage) -> Result<StatementBatch> {
        let mut batch = StatementBatch::new();
        for dest in self.destinations.iter().filter(|d| d.on_delete) {
            let filter = dest.key_filter(table, values)?;
            batch.push(dest.channel(), delete_statement(&dest.target(), &filter)?);
        }
        Ok(batch)
    }
}

/// 매핑 파일 읽기 및 검증
pub fn load_mapping_file(path: impl AsRef<Path>) -> Result<MappingConfig> {
    let text = std::fs::read_to_string(path.as_ref())?;
    let config: MappingConfig = serde_json::from_str(&text)?;
    config.validate()?;
    Ok(config)
}

impl MapperRegistry {
    /// 매핑 설정으로 레지스트리 구성. 매핑에 없는 테이블은 무시합니다.
    pub fn from_mapping_config(config: MappingConfig) -> Result<Self> {
        config.validate()?;
        let mut registry = MapperRegistry::noop();
        for table in config.tables {
            registry.register(
                table.source_schema.as_deref(),
                &table.source_table,
                Arc::new(DeclarativeMapper::new(table.destinations)),
            );
        }
        info!("Loaded {} table mappings", registry.len());
        Ok(registry)
    }
}
