//! 위치 / 시간 범위 필터
//!
//! 이벤트마다 설정된 시작/끝 위치, 시작/종료 시간, stop-never 여부를 보고
//! 처리할지, 건너뛸지, 스트림을 끝낼지 결정합니다.

use crate::config::{parse_datetime, Binlog2SqlConfig};
use crate::error::{CdcError, Result};
use crate::events::ReplicationEvent;
use crate::offset::{file_sequence, BinlogPosition};
use chrono::{Local, NaiveDateTime, TimeZone};
use tracing::debug;

const DEFAULT_START_TIME: &str = "1980-01-01 00:00:00";
const DEFAULT_STOP_TIME: &str = "2999-12-31 00:00:00";

/// 처리 범위 (불변)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeWindow {
    pub start: BinlogPosition,
    /// position 0은 끝 파일 안에서 상한 없음
    pub end: BinlogPosition,
    pub start_time: NaiveDateTime,
    pub stop_time: NaiveDateTime,
    pub stop_never: bool,
}

impl RangeWindow {
    pub fn from_config(config: &Binlog2SqlConfig) -> Result<Self> {
        let start_time = match config.start_datetime()? {
            Some(t) => t,
            None => parse_datetime(DEFAULT_START_TIME)?,
        };
        let stop_time = match config.stop_datetime()? {
            Some(t) => t,
            None => parse_datetime(DEFAULT_STOP_TIME)?,
        };

        Ok(RangeWindow {
            start: BinlogPosition::new(config.start_file.clone(), config.start_pos),
            end: BinlogPosition::new(config.effective_end_file(), config.end_pos),
            start_time,
            stop_time,
            stop_never: config.stop_never,
        })
    }
}

/// 이벤트별 판정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Accept,
    /// 끝 경계에 정확히 도달: 처리한 뒤 스트림 종료
    AcceptLast,
    SkipBeforeRange,
    Stop,
}

/// 범위 필터
#[derive(Debug, Clone)]
pub struct RangeFilter {
    window: RangeWindow,
    /// 시작 시점에 스냅샷한 로그 끝 위치
    eof: BinlogPosition,
    candidates: Vec<String>,
}

impl RangeFilter {
    /// `server_logs`는 서버가 알고 있는 binlog 파일 목록
    pub fn new(window: RangeWindow, eof: BinlogPosition, server_logs: &[String]) -> Result<Self> {
        let candidates = candidate_files(&window.start.filename, &window.end.filename, server_logs)?;
        debug!("Candidate binlog files: {:?}", candidates);
        Ok(RangeFilter {
            window,
            eof,
            candidates,
        })
    }

    pub fn window(&self) -> &RangeWindow {
        &self.window
    }

    pub fn eof(&self) -> &BinlogPosition {
        &self.eof
    }

    pub fn candidate_files(&self) -> &[String] {
        &self.candidates
    }

    pub fn decide(&self, event: &ReplicationEvent) -> FilterDecision {
        if self.window.stop_never {
            return FilterDecision::Accept;
        }

        let file = event.log_file.as_str();
        let pos = event.log_pos;
        let end = &self.window.end;
        let event_time = event_time(event.timestamp);

        // 끝 경계 일치 검사를 초과 검사보다 먼저 해야 경계 이벤트까지 정확히 처리됨
        let at_end = end.position > 0 && file == end.filename && pos == end.position;
        let at_eof = file == self.eof.filename && pos == self.eof.position;
        if at_end || at_eof {
            return FilterDecision::AcceptLast;
        }

        if event_time < self.window.start_time {
            return FilterDecision::SkipBeforeRange;
        }

        let past_end = end.position > 0 && file == end.filename && pos > end.position;
        let past_eof = file == self.eof.filename && pos > self.eof.position;
        let unknown_file = !self.candidates.iter().any(|f| f == file);
        if unknown_file || past_end || past_eof || event_time >= self.window.stop_time {
            return FilterDecision::Stop;
        }

        FilterDecision::Accept
    }
}

/// 이벤트 타임스탬프를 로컬 시간으로. 없거나 잘못된 값은 1980-01-01 00:00:00
pub fn event_time(timestamp: Option<u32>) -> NaiveDateTime {
    timestamp
        .and_then(|ts| Local.timestamp_opt(i64::from(ts), 0).single())
        .map(|dt| dt.naive_local())
        .unwrap_or_else(fallback_time)
}

fn fallback_time() -> NaiveDateTime {
    chrono::NaiveDate::from_ymd_opt(1980, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// 시작 파일과 끝 파일 사이(포함)의 파일 중 서버에 존재하는 것
pub fn candidate_files(start_file: &str, end_file: &str, server_logs: &[String]) -> Result<Vec<String>> {
    if !server_logs.iter().any(|f| f == start_file) {
        return Err(CdcError::ConfigurationError(format!(
            "start_file {} 이 서버에 존재하지 않습니다",
            start_file
        )));
    }

    let start_seq = file_sequence(start_file).ok_or_else(|| {
        CdcError::ConfigurationError(format!("binlog 파일명에서 번호를 읽을 수 없습니다: {}", start_file))
    })?;
    let end_seq = file_sequence(end_file).ok_or_else(|| {
        CdcError::ConfigurationError(format!("binlog 파일명에서 번호를 읽을 수 없습니다: {}", end_file))
    })?;

    Ok(server_logs
        .iter()
        .filter(|f| file_sequence(f).is_some_and(|seq| start_seq <= seq && seq <= end_seq))
        .cloned()
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;

    fn logs() -> Vec<String> {
        (1..=4).map(|i| format!("mysql-bin.{:06}", i)).collect()
    }

    fn local_ts(value: &str) -> u32 {
        let naive = parse_datetime(value).unwrap();
        Local.from_local_datetime(&naive).single().unwrap().timestamp() as u32
    }

    fn window(end_file: &str, end_pos: u64) -> RangeWindow {
        RangeWindow {
            start: BinlogPosition::new("mysql-bin.000001", 4),
            end: BinlogPosition::new(end_file, end_pos),
            start_time: parse_datetime(DEFAULT_START_TIME).unwrap(),
            stop_time: parse_datetime(DEFAULT_STOP_TIME).unwrap(),
            stop_never: false,
        }
    }

    fn at(file: &str, pos: u64) -> ReplicationEvent {
        ReplicationEvent::new(Some(local_ts("2024-05-01 12:00:00")), file, pos, EventPayload::Xid)
    }

    #[test]
    fn test_candidate_files() {
        let files = candidate_files("mysql-bin.000002", "mysql-bin.000003", &logs()).unwrap();
        assert_eq!(files, vec!["mysql-bin.000002", "mysql-bin.000003"]);

        let err = candidate_files("mysql-bin.000009", "mysql-bin.000009", &logs()).unwrap_err();
        assert!(matches!(err, CdcError::ConfigurationError(_)));
    }

    #[test]
    fn test_accepts_exactly_until_end_boundary() {
        let filter = RangeFilter::new(
            window("mysql-bin.000001", 500),
            BinlogPosition::new("mysql-bin.000004", 9000),
            &logs(),
        )
        .unwrap();

        let decisions: Vec<FilterDecision> = [120u64, 300, 500, 620]
            .iter()
            .map(|pos| filter.decide(&at("mysql-bin.000001", *pos)))
            .collect();
        assert_eq!(
            decisions,
            vec![
                FilterDecision::Accept,
                FilterDecision::Accept,
                FilterDecision::AcceptLast,
                FilterDecision::Stop
            ]
        );
    }

    #[test]
    fn test_past_end_without_exact_match_stops() {
        let filter = RangeFilter::new(
            window("mysql-bin.000001", 500),
            BinlogPosition::new("mysql-bin.000004", 9000),
            &logs(),
        )
        .unwrap();
        assert_eq!(filter.decide(&at("mysql-bin.000001", 450)), FilterDecision::Accept);
        assert_eq!(filter.decide(&at("mysql-bin.000001", 530)), FilterDecision::Stop);
    }

    #[test]
    fn test_live_eof_snapshot_bounds_stream() {
        // end_pos 0: 끝 파일 안에서는 상한 없음, 로그 끝 스냅샷에서 멈춤
        let filter = RangeFilter::new(
            window("mysql-bin.000002", 0),
            BinlogPosition::new("mysql-bin.000002", 800),
            &logs(),
        )
        .unwrap();
        assert_eq!(filter.decide(&at("mysql-bin.000001", 100_000)), FilterDecision::Accept);
        assert_eq!(filter.decide(&at("mysql-bin.000002", 800)), FilterDecision::AcceptLast);
        assert_eq!(filter.decide(&at("mysql-bin.000002", 900)), FilterDecision::Stop);
    }

    #[test]
    fn test_file_outside_candidates_stops() {
        let filter = RangeFilter::new(
            window("mysql-bin.000002", 0),
            BinlogPosition::new("mysql-bin.000004", 9000),
            &logs(),
        )
        .unwrap();
        assert_eq!(filter.decide(&at("mysql-bin.000003", 4)), FilterDecision::Stop);
    }

    #[test]
    fn test_time_window() {
        let mut w = window("mysql-bin.000001", 0);
        w.start_time = parse_datetime("2024-05-01 00:00:00").unwrap();
        w.stop_time = parse_datetime("2024-05-02 00:00:00").unwrap();
        let filter = RangeFilter::new(w, BinlogPosition::new("mysql-bin.000004", 9000), &logs()).unwrap();

        let before = ReplicationEvent::new(
            Some(local_ts("2024-04-30 23:59:59")),
            "mysql-bin.000001",
            200,
            EventPayload::Xid,
        );
        let inside = ReplicationEvent::new(
            Some(local_ts("2024-05-01 08:00:00")),
            "mysql-bin.000001",
            300,
            EventPayload::Xid,
        );
        let after = ReplicationEvent::new(
            Some(local_ts("2024-05-02 00:00:00")),
            "mysql-bin.000001",
            400,
            EventPayload::Xid,
        );

        assert_eq!(filter.decide(&before), FilterDecision::SkipBeforeRange);
        assert_eq!(filter.decide(&inside), FilterDecision::Accept);
        assert_eq!(filter.decide(&after), FilterDecision::Stop);
    }

    #[test]
    fn test_stop_never_accepts_everything() {
        let mut w = window("mysql-bin.000001", 500);
        w.stop_never = true;
        let filter = RangeFilter::new(w, BinlogPosition::new("mysql-bin.000001", 500), &logs()).unwrap();
        assert_eq!(filter.decide(&at("mysql-bin.000009", 99_999)), FilterDecision::Accept);
    }

    #[test]
    fn test_missing_timestamp_uses_fallback() {
        assert_eq!(event_time(None), parse_datetime(DEFAULT_START_TIME).unwrap());
    }

    #[test]
    fn test_window_from_config_defaults() {
        let config = Binlog2SqlConfig {
            start_file: "mysql-bin.000003".to_string(),
            ..Default::default()
        };
        let w = RangeWindow::from_config(&config).unwrap();
        assert_eq!(w.start, BinlogPosition::new("mysql-bin.000003", 4));
        assert_eq!(w.end, BinlogPosition::new("mysql-bin.000003", 0));
        assert_eq!(w.start_time, parse_datetime(DEFAULT_START_TIME).unwrap());
        assert!(!w.stop_never);
    }
}
