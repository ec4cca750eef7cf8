//! 행 이벤트 / DDL 이벤트로부터 SQL 문장 생성
//!
//! 문장은 `?` 자리표시자를 가진 템플릿과 자리표시자 순서대로 정렬된 값 목록으로
//! 만들어지고, 출력 직전에 `render()`로 리터럴 SQL이 됩니다.
//!
//! UPDATE의 값 순서는 항상 자리표시자 순서(SET 값, 그 다음 WHERE 값)를 따릅니다.

use crate::classifier::EventKind;
use crate::error::{CdcError, Result};
use crate::events::{CellValue, EventPayload, QueryEventData, ReplicationEvent, RowChange, RowImage, TableRef};
use chrono::Timelike;
use std::collections::HashMap;
use std::sync::Arc;

/// 바인딩 자리표시자
pub const PLACEHOLDER: char = '?';

/// 템플릿 + 바인딩 값
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub template: String,
    pub values: Vec<CellValue>,
}

impl SqlStatement {
    pub fn new(template: impl Into<String>, values: Vec<CellValue>) -> Self {
        SqlStatement {
            template: template.into(),
            values,
        }
    }

    /// 바인딩 값이 없는 문장 (DDL 등)
    pub fn literal(sql: impl Into<String>) -> Self {
        SqlStatement::new(sql, Vec::new())
    }

    /// 값을 이스케이프해서 자리표시자에 채운 리터럴 SQL
    ///
    /// 백틱으로 감싼 식별자 안의 `?`는 자리표시자로 보지 않습니다.
    pub fn render(&self) -> Result<String> {
        if self.values.is_empty() {
            return Ok(self.template.clone());
        }

        let mut out = String::with_capacity(self.template.len() + self.values.len() * 8);
        let mut values = self.values.iter();
        let mut in_identifier = false;

        for c in self.template.chars() {
            match c {
                '`' => {
                    in_identifier = !in_identifier;
                    out.push(c);
                }
                PLACEHOLDER if !in_identifier => {
                    let value = values.next().ok_or_else(|| {
                        CdcError::StreamIntegrityError(format!("바인딩 값이 부족합니다: {}", self.template))
                    })?;
                    out.push_str(&render_value(value));
                }
                _ => out.push(c),
            }
        }

        if values.next().is_some() {
            return Err(CdcError::StreamIntegrityError(format!(
                "바인딩 값이 자리표시자보다 많습니다: {}",
                self.template
            )));
        }
        Ok(out)
    }
}

/// 채널별 문장
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStatement {
    pub channel: String,
    pub statement: SqlStatement,
}

/// 하나의 행(또는 DDL)에서 생성된 문장 묶음. 채널 순서를 유지합니다.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementBatch {
    entries: Vec<ChannelStatement>,
}

impl StatementBatch {
    pub fn new() -> Self {
        StatementBatch::default()
    }

    pub fn single(channel: impl Into<String>, statement: SqlStatement) -> Self {
        let mut batch = StatementBatch::new();
        batch.push(channel, statement);
        batch
    }

    pub fn push(&mut self, channel: impl Into<String>, statement: SqlStatement) {
        self.entries.push(ChannelStatement {
            channel: channel.into(),
            statement,
        });
    }

    pub fn get(&self, channel: &str) -> Option<&SqlStatement> {
        self.entries
            .iter()
            .find(|e| e.channel == channel)
            .map(|e| &e.statement)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelStatement> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IntoIterator for StatementBatch {
    type Item = ChannelStatement;
    type IntoIter = std::vec::IntoIter<ChannelStatement>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

pub fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_identifier(schema), quote_identifier(table))
}

/// NULL 값은 `=` 대신 `IS ?`로 비교
pub fn compare_item(column: &str, value: &CellValue) -> String {
    if value.is_null() {
        format!("{} IS {}", quote_identifier(column), PLACEHOLDER)
    } else {
        format!("{}={}", quote_identifier(column), PLACEHOLDER)
    }
}

fn where_clause<'a>(items: impl Iterator<Item = (&'a str, &'a CellValue)>) -> String {
    items
        .map(|(column, value)| compare_item(column, value))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn set_clause<'a>(columns: impl Iterator<Item = &'a str>) -> String {
    columns
        .map(|column| format!("{}={}", quote_identifier(column), PLACEHOLDER))
        .collect::<Vec<_>>()
        .join(", ")
}

fn placeholders(count: usize) -> String {
    vec![PLACEHOLDER.to_string(); count].join(", ")
}

fn normalized_values<'a>(values: impl Iterator<Item = &'a CellValue>) -> Vec<CellValue> {
    values.map(CellValue::normalized).collect()
}

/// `INSERT INTO s.t(cols) VALUES (...)`
pub fn insert_statement(target: &TableRef, values: &RowImage) -> SqlStatement {
    let columns = values
        .column_names()
        .map(quote_identifier)
        .collect::<Vec<_>>()
        .join(", ");
    let template = format!(
        "INSERT INTO {}({}) VALUES ({});",
        qualified_table(&target.schema, &target.table),
        columns,
        placeholders(values.len())
    );
    SqlStatement::new(template, normalized_values(values.values()))
}

/// `UPDATE s.t SET .. WHERE .. LIMIT 1`, 값은 SET 이미지 다음 WHERE 이미지 순서
pub fn update_statement(target: &TableRef, set: &RowImage, filter: &RowImage) -> Result<SqlStatement> {
    if set.is_empty() || filter.is_empty() {
        return Err(CdcError::StreamIntegrityError(format!(
            "{}.{}: UPDATE에 사용할 행 이미지가 비어 있습니다",
            target.schema, target.table
        )));
    }
    let template = format!(
        "UPDATE {} SET {} WHERE {} LIMIT 1;",
        qualified_table(&target.schema, &target.table),
        set_clause(set.column_names()),
        where_clause(filter.iter())
    );
    let values = normalized_values(set.values().chain(filter.values()));
    Ok(SqlStatement::new(template, values))
}

/// `DELETE FROM s.t WHERE .. LIMIT 1`
pub fn delete_statement(target: &TableRef, filter: &RowImage) -> Result<SqlStatement> {
    if filter.is_empty() {
        return Err(CdcError::StreamIntegrityError(format!(
            "{}.{}: DELETE에 사용할 행 이미지가 비어 있습니다",
            target.schema, target.table
        )));
    }
    let template = format!(
        "DELETE FROM {} WHERE {} LIMIT 1;",
        qualified_table(&target.schema, &target.table),
        where_clause(filter.iter())
    );
    Ok(SqlStatement::new(template, normalized_values(filter.values())))
}

/// 값을 SQL 리터럴로 변환
pub fn render_value(value: &CellValue) -> String {
    match value.normalized() {
        CellValue::Null => "NULL".to_string(),
        CellValue::Int(v) => v.to_string(),
        CellValue::UInt(v) => v.to_string(),
        CellValue::Float(v) if v.is_finite() => v.to_string(),
        CellValue::Double(v) if v.is_finite() => v.to_string(),
        CellValue::Float(_) | CellValue::Double(_) => "NULL".to_string(),
        CellValue::Decimal(v) => {
            if v.chars().any(|c| c.is_ascii_digit()) && v.chars().all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E')) {
                v
            } else {
                quote_string(&v)
            }
        }
        CellValue::String(v) => quote_string(&v),
        CellValue::DateTime(dt) => {
            if dt.nanosecond() / 1_000 == 0 {
                quote_string(&dt.format("%Y-%m-%d %H:%M:%S").to_string())
            } else {
                quote_string(&dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string())
            }
        }
        CellValue::Date(d) => quote_string(&d.format("%Y-%m-%d").to_string()),
        CellValue::Time(t) => quote_string(&t),
        CellValue::Json(v) => quote_string(&v.to_string()),
        CellValue::Set(items) => quote_string(&items.join(",")),
        // UTF-8이 아닌 바이너리는 16진 리터럴
        CellValue::Bytes(bytes) => hex_literal(&bytes),
    }
}

fn hex_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2 + 3);
    out.push_str("X'");
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out.push('\'');
    out
}

fn quote_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1a' => out.push_str("\\Z"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// 테이블별 행 변환 기능
///
/// 정방향 모드에서만 사용됩니다. 롤백 SQL은 항상 원본 테이블을 대상으로 만듭니다.
pub trait RowMapper: Send + Sync {
    fn build_insert(&self, table: &TableRef, values: &RowImage) -> Result<StatementBatch>;

    /// 기본 키 컬럼 값을 뺀 INSERT (no_pk)
    ///
    /// 매퍼는 전체 행 이미지를 받고, 원본 `primary_key`에서 온 대상 컬럼만 제외합니다.
    fn build_insert_without_key(&self, table: &TableRef, values: &RowImage, primary_key: &str) -> Result<StatementBatch> {
        let mut values = values.clone();
        values.remove(primary_key);
        self.build_insert(table, &values)
    }

    fn build_update(&self, table: &TableRef, before: &RowImage, after: &RowImage) -> Result<StatementBatch>;

    fn build_delete(&self, _table: &TableRef, _values: &RowImage) -> Result<StatementBatch> {
        Ok(StatementBatch::new())
    }
}

/// 원본 테이블에 그대로 재실행하는 매퍼. 채널명은 스키마명
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapper;

impl RowMapper for IdentityMapper {
    fn build_insert(&self, table: &TableRef, values: &RowImage) -> Result<StatementBatch> {
        Ok(StatementBatch::single(&table.schema, insert_statement(table, values)))
    }

    fn build_update(&self, table: &TableRef, before: &RowImage, after: &RowImage) -> Result<StatementBatch> {
        Ok(StatementBatch::single(&table.schema, update_statement(table, after, before)?))
    }

    fn build_delete(&self, table: &TableRef, values: &RowImage) -> Result<StatementBatch> {
        Ok(StatementBatch::single(&table.schema, delete_statement(table, values)?))
    }
}

/// 아무 문장도 만들지 않는 매퍼 (매핑 설정에 없는 테이블)
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMapper;

impl RowMapper for NoopMapper {
    fn build_insert(&self, _table: &TableRef, _values: &RowImage) -> Result<StatementBatch> {
        Ok(StatementBatch::new())
    }

    fn build_update(&self, _table: &TableRef, _before: &RowImage, _after: &RowImage) -> Result<StatementBatch> {
        Ok(StatementBatch::new())
    }
}

/// (schema, table) -> RowMapper
pub struct MapperRegistry {
    exact: HashMap<TableRef, Arc<dyn RowMapper>>,
    /// 스키마와 무관하게 테이블명으로만 매칭
    by_table: HashMap<String, Arc<dyn RowMapper>>,
    fallback: Arc<dyn RowMapper>,
}

impl MapperRegistry {
    /// 등록되지 않은 테이블은 원본 그대로 재실행
    pub fn identity() -> Self {
        MapperRegistry::with_fallback(Arc::new(IdentityMapper))
    }

    /// 등록되지 않은 테이블은 무시
    pub fn noop() -> Self {
        MapperRegistry::with_fallback(Arc::new(NoopMapper))
    }

    pub fn with_fallback(fallback: Arc<dyn RowMapper>) -> Self {
        MapperRegistry {
            exact: HashMap::new(),
            by_table: HashMap::new(),
            fallback,
        }
    }

    /// schema가 None이면 모든 스키마의 같은 이름 테이블에 적용
    pub fn register(&mut self, schema: Option<&str>, table: &str, mapper: Arc<dyn RowMapper>) {
        match schema {
            Some(schema) => {
                self.exact.insert(TableRef::new(schema, table), mapper);
            }
            None => {
                self.by_table.insert(table.to_string(), mapper);
            }
        }
    }

    pub fn resolve(&self, table: &TableRef) -> &dyn RowMapper {
        let mapper = self
            .exact
            .get(table)
            .or_else(|| self.by_table.get(&table.table))
            .unwrap_or(&self.fallback);
        &**mapper
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.by_table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MapperRegistry {
    fn default() -> Self {
        MapperRegistry::identity()
    }
}

/// 문장 생성 옵션
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// 역방향(롤백) 문장 생성
    pub flashback: bool,
    /// INSERT에서 기본 키 컬럼 제거
    pub no_pk: bool,
}

/// 분류된 이벤트로부터 SQL 문장 생성
pub struct StatementBuilder {
    options: BuildOptions,
    registry: MapperRegistry,
}

impl StatementBuilder {
    pub fn new(options: BuildOptions, registry: MapperRegistry) -> Result<Self> {
        if options.flashback && options.no_pk {
            return Err(CdcError::ConfigurationError(
                "flashback과 no_pk는 동시에 사용할 수 없습니다".to_string(),
            ));
        }
        Ok(StatementBuilder { options, registry })
    }

    pub fn options(&self) -> BuildOptions {
        self.options
    }

    /// 이벤트 하나에서 행마다 하나의 묶음 생성
    ///
    /// `primary_key`는 no_pk INSERT에서만 사용됩니다.
    pub fn build(&self, kind: EventKind, event: &ReplicationEvent, primary_key: Option<&str>) -> Result<Vec<StatementBatch>> {
        match (kind, &event.payload) {
            (EventKind::RowInsert, EventPayload::WriteRows(data))
            | (EventKind::RowUpdate, EventPayload::UpdateRows(data))
            | (EventKind::RowDelete, EventPayload::DeleteRows(data)) => data
                .rows
                .iter()
                .map(|row| self.build_row(kind, &data.table, row, primary_key))
                .collect(),
            (EventKind::DdlQuery, EventPayload::Query(query)) => Ok(vec![self.build_query(query)]),
            _ => Err(CdcError::StreamIntegrityError(format!(
                "INSERT, UPDATE, DELETE, DDL 이벤트만 처리할 수 있습니다: {:?} at {}:{}",
                kind, event.log_file, event.log_pos
            ))),
        }
    }

    pub fn build_row(
        &self,
        kind: EventKind,
        table: &TableRef,
        row: &RowChange,
        primary_key: Option<&str>,
    ) -> Result<StatementBatch> {
        match (kind, row) {
            (EventKind::RowInsert, RowChange::Values(values)) => {
                if self.options.flashback {
                    return Ok(StatementBatch::single(&table.schema, delete_statement(table, values)?));
                }
                let mapper = self.registry.resolve(table);
                match primary_key.filter(|_| self.options.no_pk) {
                    Some(pk) => mapper.build_insert_without_key(table, values, pk),
                    None => mapper.build_insert(table, values),
                }
            }
            (EventKind::RowDelete, RowChange::Values(values)) => {
                if self.options.flashback {
                    return Ok(StatementBatch::single(&table.schema, insert_statement(table, values)));
                }
                self.registry.resolve(table).build_delete(table, values)
            }
            (EventKind::RowUpdate, RowChange::Update { before, after }) => {
                if self.options.flashback {
                    return Ok(StatementBatch::single(&table.schema, update_statement(table, before, after)?));
                }
                self.registry.resolve(table).build_update(table, before, after)
            }
            _ => Err(CdcError::StreamIntegrityError(format!(
                "{}.{}: {:?} 이벤트의 행 형태가 올바르지 않습니다",
                table.schema, table.table, kind
            ))),
        }
    }

    /// DDL은 정방향에서만 `USE schema;` + 원본 쿼리로 출력. BEGIN/COMMIT은 무시
    pub fn build_query(&self, query: &QueryEventData) -> StatementBatch {
        let text = query.query_text();
        if self.options.flashback || text == "BEGIN" || text == "COMMIT" {
            return StatementBatch::new();
        }

        let mut sql = String::new();
        if !query.schema.is_empty() {
            sql.push_str(&format!("USE {};\n", query.schema));
        }
        sql.push_str(&text);
        sql.push(';');
        StatementBatch::single(&query.schema, SqlStatement::literal(sql))
    }
}
