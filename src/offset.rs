//! Binlog 처리 위치 추적 (BinlogPosition 및 트랜잭션 커서)
//!
//! Binlog 파일명 + 위치로 이벤트 위치를 표현합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치

use crate::classifier::EventKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 모든 binlog 파일의 최소 유효 위치 (파일 헤더 크기)
pub const MIN_BINLOG_POSITION: u64 = 4;

/// Binlog 파일 위치 정보
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub filename: String,
    /// 바이트 위치
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(filename: impl Into<String>, position: u64) -> Self {
        BinlogPosition {
            filename: filename.into(),
            position,
        }
    }
}

/// "mysql-bin.000123" -> 123
pub fn file_sequence(filename: &str) -> Option<u64> {
    filename.rsplit('.').next().and_then(|s| s.parse().ok())
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}

/// 현재 열린 트랜잭션의 시작 위치 추적
///
/// `transaction_start`는 가장 최근 BEGIN 직전에 관측된 위치이고,
/// `last_seen`은 마지막으로 소비한 비제어 이벤트의 위치입니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionCursor {
    transaction_start: u64,
    last_seen: u64,
    track_ddl: bool,
}

impl TransactionCursor {
    pub fn new(start_position: u64) -> Self {
        TransactionCursor {
            transaction_start: start_position,
            last_seen: start_position,
            track_ddl: true,
        }
    }

    /// DDL 이벤트도 `last_seen`을 갱신할지 여부
    pub fn with_ddl_tracking(mut self, track_ddl: bool) -> Self {
        self.track_ddl = track_ddl;
        self
    }

    /// 범위 안의 이벤트 처리 후 호출
    pub fn on_event(&mut self, kind: EventKind, current_offset: u64) {
        if kind == EventKind::TxBegin {
            self.transaction_start = self.last_seen;
        }
        self.advance(kind, current_offset);
    }

    /// 시작 시간 이전이라 건너뛴 이벤트: 위치 기록만 갱신
    pub fn on_skipped(&mut self, kind: EventKind, current_offset: u64) {
        self.advance(kind, current_offset);
    }

    fn advance(&mut self, kind: EventKind, current_offset: u64) {
        if kind.is_stream_control() {
            return;
        }
        if kind == EventKind::DdlQuery && !self.track_ddl {
            return;
        }
        self.last_seen = current_offset;
    }

    pub fn transaction_start(&self) -> u64 {
        self.transaction_start
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }
}

/// StreamDriver 처리 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingState {
    /// 설정 검증 및 스냅샷
    Init,
    /// 이벤트 스트리밍 중
    Streaming,
    /// 롤백 SQL 역순 출력 중
    DrainingFlashback,
    /// 종료됨
    Done,
}
