//! binlog2sql 실행 설정
//!
//! 설정은 환경 변수 또는 JSON 파일에서 읽습니다. 접속 비밀번호는 코드에
//! 두지 않고 항상 외부에서 주입합니다.

use crate::connection::ConnectionConfig;
use crate::error::{CdcError, Result};
use crate::events::OperationType;
use crate::offset::MIN_BINLOG_POSITION;
use chrono::NaiveDateTime;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// 날짜 입력 형식
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 롤백 SQL 배치 크기 기본값
pub const DEFAULT_ROLLBACK_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Binlog2SqlConfig {
    /// binlog를 읽을 원본 서버
    pub source: ConnectionConfig,
    /// 생성된 SQL을 실행할 대상 서버 (없으면 stdout 출력만)
    pub destination: Option<ConnectionConfig>,
    pub start_file: String,
    pub start_pos: u64,
    /// 비어 있으면 start_file과 같음
    pub end_file: String,
    /// 0이면 end_file 안에서 상한 없음
    pub end_pos: u64,
    pub start_time: Option<String>,
    pub stop_time: Option<String>,
    pub only_schemas: Vec<String>,
    pub only_tables: Vec<String>,
    pub sql_types: Vec<OperationType>,
    pub include_ddl: bool,
    pub no_pk: bool,
    pub flashback: bool,
    pub stop_never: bool,
    /// 롤백 배치 사이 대기 시간 (초, 0이면 대기 없음)
    pub back_interval: f64,
    pub rollback_batch_size: usize,
    /// 문장 끝에 `#start .. end .. time ..` 주석 추가
    pub annotate_positions: bool,
    /// DDL 이벤트도 트랜잭션 오프셋 기록에 참여
    pub track_ddl_offsets: bool,
    /// 복제 연결에 사용할 server id (없으면 원본 서버의 @@server_id)
    pub replica_server_id: Option<u32>,
    pub rollback_dir: PathBuf,
    pub mapping_file: Option<PathBuf>,
}

impl Default for Binlog2SqlConfig {
    fn default() -> Self {
        Binlog2SqlConfig {
            source: ConnectionConfig::default(),
            destination: None,
            start_file: String::new(),
            start_pos: MIN_BINLOG_POSITION,
            end_file: String::new(),
            end_pos: 0,
            start_time: None,
            stop_time: None,
            only_schemas: Vec::new(),
            only_tables: Vec::new(),
            sql_types: OperationType::all(),
            include_ddl: false,
            no_pk: false,
            flashback: false,
            stop_never: false,
            back_interval: 1.0,
            rollback_batch_size: DEFAULT_ROLLBACK_BATCH_SIZE,
            annotate_positions: false,
            track_ddl_offsets: true,
            replica_server_id: None,
            rollback_dir: PathBuf::from("."),
            mapping_file: None,
        }
    }
}

impl Binlog2SqlConfig {
    /// 프로세스 환경 변수에서 설정 읽기
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// JSON 설정 파일 읽기
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Binlog2SqlConfig = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// 키 조회 함수로부터 설정 구성 (테스트에서 환경 변수 대신 사용)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Binlog2SqlConfig::default();

        config.source = connection_from_lookup(&get, "DB")?.unwrap_or_default();
        config.destination = connection_from_lookup(&get, "DEST_DB")?;

        if let Some(v) = get("BINLOG2SQL_START_FILE") {
            config.start_file = v;
        }
        if let Some(v) = get("BINLOG2SQL_START_POS") {
            config.start_pos = parse_number("BINLOG2SQL_START_POS", &v)?;
        }
        if let Some(v) = get("BINLOG2SQL_END_FILE") {
            config.end_file = v;
        }
        if let Some(v) = get("BINLOG2SQL_END_POS") {
            config.end_pos = parse_number("BINLOG2SQL_END_POS", &v)?;
        }
        config.start_time = get("BINLOG2SQL_START_TIME");
        config.stop_time = get("BINLOG2SQL_STOP_TIME");
        config.only_schemas = get("BINLOG2SQL_DATABASES").map(|v| split_list(&v)).unwrap_or_default();
        config.only_tables = get("BINLOG2SQL_TABLES").map(|v| split_list(&v)).unwrap_or_default();
        if let Some(v) = get("BINLOG2SQL_SQL_TYPE") {
            config.sql_types = split_list(&v)
                .iter()
                .map(|t| {
                    OperationType::parse(t)
                        .ok_or_else(|| CdcError::ConfigurationError(format!("지원하지 않는 SQL 타입: {}", t)))
                })
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(v) = get("BINLOG2SQL_INCLUDE_DDL") {
            config.include_ddl = parse_flag("BINLOG2SQL_INCLUDE_DDL", &v)?;
        }
        if let Some(v) = get("BINLOG2SQL_NO_PK") {
            config.no_pk = parse_flag("BINLOG2SQL_NO_PK", &v)?;
        }
        if let Some(v) = get("BINLOG2SQL_FLASHBACK") {
            config.flashback = parse_flag("BINLOG2SQL_FLASHBACK", &v)?;
        }
        if let Some(v) = get("BINLOG2SQL_STOP_NEVER") {
            config.stop_never = parse_flag("BINLOG2SQL_STOP_NEVER", &v)?;
        }
        if let Some(v) = get("BINLOG2SQL_BACK_INTERVAL") {
            config.back_interval = parse_number("BINLOG2SQL_BACK_INTERVAL", &v)?;
        }
        if let Some(v) = get("BINLOG2SQL_ROLLBACK_BATCH_SIZE") {
            config.rollback_batch_size = parse_number("BINLOG2SQL_ROLLBACK_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("BINLOG2SQL_ANNOTATE") {
            config.annotate_positions = parse_flag("BINLOG2SQL_ANNOTATE", &v)?;
        }
        if let Some(v) = get("BINLOG2SQL_TRACK_DDL_OFFSETS") {
            config.track_ddl_offsets = parse_flag("BINLOG2SQL_TRACK_DDL_OFFSETS", &v)?;
        }
        if let Some(v) = get("BINLOG2SQL_SERVER_ID") {
            config.replica_server_id = Some(parse_number("BINLOG2SQL_SERVER_ID", &v)?);
        }
        if let Some(v) = get("BINLOG2SQL_ROLLBACK_DIR") {
            config.rollback_dir = PathBuf::from(v);
        }
        config.mapping_file = get("BINLOG2SQL_MAPPING_FILE").map(PathBuf::from);

        Ok(config)
    }

    /// 실행 전 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.start_file.is_empty() {
            return Err(CdcError::ConfigurationError("start_file 파라미터가 없습니다".to_string()));
        }
        if self.start_pos < MIN_BINLOG_POSITION {
            return Err(CdcError::ConfigurationError(format!(
                "start_pos는 {} 이상이어야 합니다: {}",
                MIN_BINLOG_POSITION, self.start_pos
            )));
        }
        if self.flashback && self.stop_never {
            return Err(CdcError::ConfigurationError(
                "flashback과 stop_never는 동시에 사용할 수 없습니다".to_string(),
            ));
        }
        if self.flashback && self.no_pk {
            return Err(CdcError::ConfigurationError(
                "flashback과 no_pk는 동시에 사용할 수 없습니다".to_string(),
            ));
        }
        if self.rollback_batch_size == 0 {
            return Err(CdcError::ConfigurationError(
                "rollback_batch_size는 0보다 커야 합니다".to_string(),
            ));
        }
        if !self.back_interval.is_finite() || self.back_interval < 0.0 {
            return Err(CdcError::ConfigurationError(format!(
                "잘못된 back_interval: {}",
                self.back_interval
            )));
        }
        self.start_datetime()?;
        self.stop_datetime()?;
        Ok(())
    }

    /// 끝 파일 (설정되지 않았으면 시작 파일)
    pub fn effective_end_file(&self) -> &str {
        if self.end_file.is_empty() {
            &self.start_file
        } else {
            &self.end_file
        }
    }

    pub fn start_datetime(&self) -> Result<Option<NaiveDateTime>> {
        self.start_time.as_deref().map(parse_datetime).transpose()
    }

    pub fn stop_datetime(&self) -> Result<Option<NaiveDateTime>> {
        self.stop_time.as_deref().map(parse_datetime).transpose()
    }
}

/// `%Y-%m-%d %H:%M:%S` 형식의 날짜 파싱
pub fn parse_datetime(value: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim(), DATETIME_FORMAT)
        .map_err(|e| CdcError::ConfigurationError(format!("잘못된 날짜 형식 '{}': {}", value, e)))
}

fn connection_from_lookup<G>(get: &G, prefix: &str) -> Result<Option<ConnectionConfig>>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(hostname) = get(&format!("{}_HOST", prefix)) else {
        return Ok(None);
    };
    let mut conn = ConnectionConfig::new(hostname, "root");
    if let Some(port) = get(&format!("{}_PORT", prefix)) {
        conn.port = parse_number(&format!("{}_PORT", prefix), &port)?;
    }
    if let Some(user) = get(&format!("{}_USER", prefix)) {
        conn.username = user;
    }
    if let Some(password) = get(&format!("{}_PASSWORD", prefix)) {
        conn.password = password;
    }
    if let Some(timeout) = get(&format!("{}_CONNECT_TIMEOUT", prefix)) {
        conn.connect_timeout_secs = parse_number(&format!("{}_CONNECT_TIMEOUT", prefix), &timeout)?;
    }
    conn.database = get(&format!("{}_NAME", prefix));
    Ok(Some(conn))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CdcError::ConfigurationError(format!("{} 값이 올바르지 않습니다: {}", key, value)))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CdcError::ConfigurationError(format!("{} 값이 올바르지 않습니다: {}", key, value))),
    }
}
