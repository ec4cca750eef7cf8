//! binlog2sql 실행 엔진
//!
//! 처리 단계:
//! 1. Init: 설정 검증, 서버의 binlog 목록 / 로그 끝 위치 / server id 확인
//! 2. Streaming: 이벤트마다 범위 필터 -> 분류 -> SQL 생성 -> 출력 (또는 롤백 파일에 기록)
//! 3. DrainingFlashback: 롤백 파일을 역순으로 출력한 뒤 삭제
//! 4. Done

use crate::classifier::{classify, EventKind};
use crate::config::{Binlog2SqlConfig, DATETIME_FORMAT};
use crate::error::{CdcError, Result};
use crate::events::{OperationType, ReplicationEvent};
use crate::flashback::{execute_and_commit, FlashbackEmitter, RollbackFile};
use crate::offset::{BinlogPosition, ProcessingState, TransactionCursor};
use crate::range_filter::{event_time, FilterDecision, RangeFilter, RangeWindow};
use crate::sink::SqlSink;
use crate::source::{EventStream, ReplicationServer, SchemaFilter, StreamRequest};
use crate::statement::{BuildOptions, MapperRegistry, StatementBuilder};
use serde::Serialize;
use tracing::{debug, info, warn};

/// 실행 결과 요약
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub events_read: u64,
    pub events_accepted: u64,
    /// 시작 시간 이전이라 건너뛴 이벤트
    pub events_skipped: u64,
    /// 스키마/테이블/SQL 타입 조건으로 제외된 이벤트
    pub events_filtered: u64,
    pub statements_emitted: u64,
    pub sink_failures: u64,
    pub rollback_lines: u64,
    /// 마지막으로 처리한 이벤트 위치
    pub last_position: Option<BinlogPosition>,
}

/// Init 단계 결과
struct StreamPlan {
    filter: RangeFilter,
    server_id: u32,
}

pub struct StreamDriver<S, K> {
    config: Binlog2SqlConfig,
    server: S,
    sink: K,
    builder: StatementBuilder,
    schema_filter: SchemaFilter,
    state: ProcessingState,
    summary: RunSummary,
}

impl<S: ReplicationServer, K: SqlSink> StreamDriver<S, K> {
    pub fn new(config: Binlog2SqlConfig, server: S, sink: K, registry: MapperRegistry) -> Result<Self> {
        config.validate()?;
        let builder = StatementBuilder::new(
            BuildOptions {
                flashback: config.flashback,
                no_pk: config.no_pk,
            },
            registry,
        )?;
        let schema_filter = SchemaFilter::new(config.only_schemas.clone(), config.only_tables.clone());

        Ok(StreamDriver {
            config,
            server,
            sink,
            builder,
            schema_filter,
            state: ProcessingState::Init,
            summary: RunSummary::default(),
        })
    }

    pub fn state(&self) -> ProcessingState {
        self.state
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn into_sink(self) -> K {
        self.sink
    }

    /// 설정된 범위를 끝까지 처리
    pub async fn run(&mut self) -> Result<RunSummary> {
        if self.state != ProcessingState::Init {
            return Err(CdcError::ConfigurationError("StreamDriver는 한 번만 실행할 수 있습니다".to_string()));
        }
        self.summary = RunSummary::default();

        let plan = self.init().await?;
        self.state = ProcessingState::Streaming;

        let rollback = if self.config.flashback {
            let base = self.config.rollback_dir.join(self.config.source.endpoint());
            Some(RollbackFile::create(&base)?)
        } else {
            None
        };

        let result = self.stream(plan, rollback).await;
        self.state = ProcessingState::Done;
        result?;

        info!(
            "Finished: read={}, accepted={}, skipped={}, filtered={}, statements={}, sink_failures={}, rollback_lines={}",
            self.summary.events_read,
            self.summary.events_accepted,
            self.summary.events_skipped,
            self.summary.events_filtered,
            self.summary.statements_emitted,
            self.summary.sink_failures,
            self.summary.rollback_lines
        );
        Ok(self.summary.clone())
    }

    async fn init(&mut self) -> Result<StreamPlan> {
        let logs = self.server.binary_logs().await?;

        // 원본 서버에 server_id가 없으면 복제 자체가 불가능
        let source_id = self.server.server_id().await?.ok_or_else(|| {
            CdcError::ConfigurationError("원본 서버에 server_id가 설정되어 있지 않습니다".to_string())
        })?;
        let server_id = self.config.replica_server_id.unwrap_or(source_id);

        let eof = self.server.binlog_status().await?;
        let filter = RangeFilter::new(RangeWindow::from_config(&self.config)?, eof, &logs)?;

        info!(
            "Replicating as server_id={} from {} (eof {}, candidate files {:?})",
            server_id,
            filter.window().start,
            filter.eof(),
            filter.candidate_files()
        );
        Ok(StreamPlan { filter, server_id })
    }

    async fn stream(&mut self, plan: StreamPlan, mut rollback: Option<RollbackFile>) -> Result<()> {
        let request = StreamRequest {
            start: plan.filter.window().start.clone(),
            server_id: plan.server_id,
            filter: self.schema_filter.clone(),
        };
        let mut stream = self.server.open_stream(request).await?;

        let consumed = self.consume(stream.as_mut(), &plan.filter, rollback.as_mut()).await;
        let closed = stream.close().await;
        consumed?;
        closed?;

        if let Some(file) = rollback {
            if file.lines() > 0 {
                self.state = ProcessingState::DrainingFlashback;
                let emitter = FlashbackEmitter::new(self.config.rollback_batch_size, self.config.back_interval);
                let drained = emitter.drain(file, &mut self.sink).await?;
                self.summary.statements_emitted += drained.lines;
                self.summary.sink_failures += drained.failures;
            }
        }
        Ok(())
    }

    async fn consume(
        &mut self,
        stream: &mut dyn EventStream,
        filter: &RangeFilter,
        mut rollback: Option<&mut RollbackFile>,
    ) -> Result<()> {
        let mut cursor = TransactionCursor::new(filter.window().start.position)
            .with_ddl_tracking(self.config.track_ddl_offsets);

        while let Some(event) = stream.next_event().await? {
            self.summary.events_read += 1;
            let kind = classify(&event);

            match filter.decide(&event) {
                FilterDecision::Stop => {
                    info!("Reached end of range at {}:{}", event.log_file, event.log_pos);
                    break;
                }
                FilterDecision::SkipBeforeRange => {
                    self.summary.events_skipped += 1;
                    cursor.on_skipped(kind, event.log_pos);
                }
                decision @ (FilterDecision::Accept | FilterDecision::AcceptLast) => {
                    self.summary.events_accepted += 1;
                    self.process(kind, &event, &cursor, rollback.as_deref_mut()).await?;
                    cursor.on_event(kind, event.log_pos);
                    self.summary.last_position = Some(BinlogPosition::new(event.log_file.clone(), event.log_pos));

                    if decision == FilterDecision::AcceptLast {
                        info!("Reached end boundary at {}:{}", event.log_file, event.log_pos);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn process(
        &mut self,
        kind: EventKind,
        event: &ReplicationEvent,
        cursor: &TransactionCursor,
        mut rollback: Option<&mut RollbackFile>,
    ) -> Result<()> {
        if !self.wants(kind, event) {
            return Ok(());
        }

        let primary_key = match (kind, event.rows()) {
            (EventKind::RowInsert, Some(rows)) if self.config.no_pk => self.server.primary_key(&rows.table).await?,
            _ => None,
        };

        let batches = self.builder.build(kind, event, primary_key.as_deref())?;
        let annotation = (self.config.annotate_positions && kind.is_row()).then(|| {
            format!(
                " #start {} end {} time {}",
                cursor.transaction_start(),
                event.log_pos,
                event_time(event.timestamp).format(DATETIME_FORMAT)
            )
        });

        for entry in batches.into_iter().flatten() {
            let mut sql = entry.statement.render()?;
            if let Some(annotation) = &annotation {
                sql.push_str(annotation);
            }

            match rollback.as_deref_mut() {
                Some(file) => {
                    file.append(&sql)?;
                    self.summary.rollback_lines += 1;
                }
                None => {
                    debug!("[{}] {}", entry.channel, sql);
                    self.summary.statements_emitted += 1;
                    if !execute_and_commit(&mut self.sink, &sql).await? {
                        self.summary.sink_failures += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// 스키마/테이블/SQL 타입/DDL 조건
    fn wants(&mut self, kind: EventKind, event: &ReplicationEvent) -> bool {
        let wanted = match kind {
            EventKind::RowInsert | EventKind::RowUpdate | EventKind::RowDelete => {
                operation_of(kind).is_some_and(|op| self.config.sql_types.contains(&op))
                    && self.schema_filter.matches_event(event)
            }
            EventKind::DdlQuery => self.config.include_ddl && self.schema_filter.matches_event(event),
            EventKind::TxBegin | EventKind::TxEndOrRotate | EventKind::Other => return false,
        };
        if !wanted {
            debug!("Filtered {:?} at {}:{}", kind, event.log_file, event.log_pos);
            self.summary.events_filtered += 1;
        }
        wanted
    }
}

fn operation_of(kind: EventKind) -> Option<OperationType> {
    match kind {
        EventKind::RowInsert => Some(OperationType::Insert),
        EventKind::RowUpdate => Some(OperationType::Update),
        EventKind::RowDelete => Some(OperationType::Delete),
        _ => None,
    }
}

/// 시작 직후 상태를 경고로 남길 설정 조합
pub fn warn_on_risky_config(config: &Binlog2SqlConfig) {
    if config.stop_never && config.destination.is_some() {
        warn!("stop_never with a destination: statements are applied until the process is terminated");
    }
    if config.flashback && config.destination.is_some() {
        warn!("Rollback statements will be executed against the destination");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CellValue, TableRef};
    use crate::testing::*;

    const LOG1: &str = "log.000001";
    const LOG2: &str = "log.000002";

    fn table() -> TableRef {
        TableRef::new("s", "t")
    }

    fn config(start_file: &str) -> Binlog2SqlConfig {
        Binlog2SqlConfig {
            start_file: start_file.to_string(),
            ..Default::default()
        }
    }

    fn person(id: i64, name: &str) -> crate::events::RowImage {
        image(vec![("id", CellValue::Int(id)), ("name", CellValue::from(name))])
    }

    async fn run(config: Binlog2SqlConfig, server: MockServer, sink: RecordingSink) -> (RunSummary, MockServer, RecordingSink) {
        let mut driver = StreamDriver::new(config, server, sink, MapperRegistry::identity()).unwrap();
        let summary = driver.run().await.unwrap();
        assert_eq!(driver.state(), ProcessingState::Done);
        let StreamDriver { server, sink, .. } = driver;
        (summary, server, sink)
    }

    #[tokio::test]
    async fn test_single_insert_up_to_end_boundary() {
        let server = MockServer::new(
            &[LOG1],
            vec![
                insert_event(LOG1, 120, &table(), person(1, "a")),
                insert_event(LOG1, 300, &table(), person(2, "b")),
            ],
        );
        let mut config = config(LOG1);
        config.end_pos = 120;

        let (summary, server, sink) = run(config, server, RecordingSink::default()).await;

        assert_eq!(summary.events_accepted, 1);
        assert_eq!(summary.events_read, 1);
        assert_eq!(sink.executed, vec!["INSERT INTO `s`.`t`(`id`, `name`) VALUES (1, 'a');"]);
        assert_eq!(sink.commits, 1);
        assert_eq!(summary.last_position, Some(BinlogPosition::new(LOG1, 120)));
        assert!(server.stream_closed());
    }

    #[tokio::test]
    async fn test_events_past_end_are_not_accepted() {
        let server = MockServer::new(
            &[LOG1],
            vec![
                query_event(LOG1, 120, "s", "BEGIN"),
                insert_event(LOG1, 200, &table(), person(1, "a")),
                xid_event(LOG1, 310),
                query_event(LOG1, 400, "s", "BEGIN"),
                insert_event(LOG1, 480, &table(), person(2, "b")),
            ],
        );
        let mut config = config(LOG1);
        config.end_pos = 300;

        let (summary, _, sink) = run(config, server, RecordingSink::default()).await;

        // 310은 끝 위치를 넘었으므로 Stop
        assert_eq!(summary.events_read, 3);
        assert_eq!(summary.events_accepted, 2);
        assert_eq!(sink.executed.len(), 1);
        assert!(sink.executed[0].contains("VALUES (1, 'a')"));
    }

    #[tokio::test]
    async fn test_stops_at_eof_snapshot_across_rotation() {
        let mut server = MockServer::new(
            &[LOG1, LOG2],
            vec![
                insert_event(LOG1, 200, &table(), person(1, "a")),
                rotate_event(LOG2, 4),
                insert_event(LOG2, 150, &table(), person(2, "b")),
                insert_event(LOG2, 260, &table(), person(3, "c")),
            ],
        );
        server.eof = BinlogPosition::new(LOG2, 150);
        let mut config = config(LOG1);
        config.end_file = LOG2.to_string();

        let (summary, _, sink) = run(config, server, RecordingSink::default()).await;

        assert_eq!(sink.executed.len(), 2);
        assert!(sink.executed[1].contains("VALUES (2, 'b')"));
        assert_eq!(summary.last_position, Some(BinlogPosition::new(LOG2, 150)));
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_stop_stream() {
        let server = MockServer::new(
            &[LOG1],
            vec![
                insert_event(LOG1, 200, &table(), person(1, "dup")),
                insert_event(LOG1, 300, &table(), person(2, "ok")),
            ],
        );

        let (summary, _, sink) = run(config(LOG1), server, RecordingSink::failing_on("'dup'")).await;

        assert_eq!(summary.statements_emitted, 2);
        assert_eq!(summary.sink_failures, 1);
        assert_eq!(sink.executed, vec!["INSERT INTO `s`.`t`(`id`, `name`) VALUES (2, 'ok');"]);
    }

    #[tokio::test]
    async fn test_flashback_emits_inverse_in_reverse_order() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::new(
            &[LOG1],
            vec![
                query_event(LOG1, 120, "s", "BEGIN"),
                insert_event(LOG1, 200, &table(), person(1, "a")),
                update_event(LOG1, 300, &table(), person(1, "a"), person(1, "b")),
                delete_event(LOG1, 400, &table(), person(2, "z")),
                xid_event(LOG1, 450),
                query_event(LOG1, 500, "s", "ALTER TABLE t ADD COLUMN c INT"),
            ],
        );
        let mut config = config(LOG1);
        config.flashback = true;
        config.include_ddl = true;
        config.back_interval = 0.0;
        config.rollback_dir = dir.path().to_path_buf();

        let (summary, _, sink) = run(config, server, RecordingSink::default()).await;

        assert_eq!(
            sink.executed,
            vec![
                "INSERT INTO `s`.`t`(`id`, `name`) VALUES (2, 'z');",
                "UPDATE `s`.`t` SET `id`=1, `name`='a' WHERE `id`=1 AND `name`='b' LIMIT 1;",
                "DELETE FROM `s`.`t` WHERE `id`=1 AND `name`='a' LIMIT 1;",
            ]
        );
        assert_eq!(summary.rollback_lines, 3);
        // 롤백 파일은 출력 후 삭제
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_skip_before_start_time() {
        let mut early = insert_event(LOG1, 200, &table(), person(1, "old"));
        early.timestamp = Some(TS - 86_400 * 30);
        let server = MockServer::new(&[LOG1], vec![early, insert_event(LOG1, 300, &table(), person(2, "new"))]);
        let mut config = config(LOG1);
        config.start_time = Some(event_time(Some(TS - 86_400)).format(DATETIME_FORMAT).to_string());

        let (summary, _, sink) = run(config, server, RecordingSink::default()).await;

        assert_eq!(summary.events_skipped, 1);
        assert_eq!(sink.executed.len(), 1);
        assert!(sink.executed[0].contains("'new'"));
    }

    #[tokio::test]
    async fn test_schema_type_and_ddl_filters() {
        let other = TableRef::new("s", "audit");
        let server = MockServer::new(
            &[LOG1],
            vec![
                insert_event(LOG1, 200, &table(), person(1, "a")),
                insert_event(LOG1, 300, &other, person(2, "b")),
                delete_event(LOG1, 400, &table(), person(1, "a")),
                query_event(LOG1, 500, "s", "CREATE TABLE x (id INT)"),
            ],
        );
        let mut config = config(LOG1);
        config.only_tables = vec!["t".to_string()];
        config.sql_types = vec![OperationType::Insert];

        let (summary, _, sink) = run(config, server, RecordingSink::default()).await;

        assert_eq!(summary.events_filtered, 3);
        assert_eq!(sink.executed, vec!["INSERT INTO `s`.`t`(`id`, `name`) VALUES (1, 'a');"]);
    }

    #[tokio::test]
    async fn test_include_ddl_forward() {
        let server = MockServer::new(&[LOG1], vec![query_event(LOG1, 500, "s", "CREATE TABLE x (id INT)")]);
        let mut config = config(LOG1);
        config.include_ddl = true;

        let (_, _, sink) = run(config, server, RecordingSink::default()).await;
        assert_eq!(sink.executed, vec!["USE s;\nCREATE TABLE x (id INT);"]);
    }

    #[tokio::test]
    async fn test_no_pk_uses_metadata_provider() {
        let server = MockServer::new(&[LOG1], vec![insert_event(LOG1, 200, &table(), person(7, "a"))])
            .with_primary_key(&table(), "id");
        let mut config = config(LOG1);
        config.no_pk = true;

        let (_, _, sink) = run(config, server, RecordingSink::default()).await;
        assert_eq!(sink.executed, vec!["INSERT INTO `s`.`t`(`name`) VALUES ('a');"]);
    }

    #[tokio::test]
    async fn test_no_pk_with_table_mapping() {
        let mapping: crate::mapping::MappingConfig = serde_json::from_str(
            r#"{
                "tables": [{
                    "source_schema": "s",
                    "source_table": "t",
                    "destinations": [{
                        "schema": "x", "table": "y", "key_column": "uid", "source_key": "id",
                        "columns": [
                            { "target": "uid", "from": "id" },
                            { "target": "nm", "from": "name" }
                        ]
                    }]
                }]
            }"#,
        )
        .unwrap();
        let registry = MapperRegistry::from_mapping_config(mapping).unwrap();
        let server = MockServer::new(&[LOG1], vec![insert_event(LOG1, 200, &table(), person(7, "a"))])
            .with_primary_key(&table(), "id");
        let mut config = config(LOG1);
        config.no_pk = true;

        let mut driver = StreamDriver::new(config, server, RecordingSink::default(), registry).unwrap();
        let summary = driver.run().await.unwrap();

        assert_eq!(summary.statements_emitted, 1);
        assert_eq!(driver.sink().executed, vec!["INSERT INTO `x`.`y`(`nm`) VALUES ('a');"]);
    }

    #[tokio::test]
    async fn test_annotation_uses_transaction_start() {
        let server = MockServer::new(
            &[LOG1],
            vec![
                query_event(LOG1, 120, "s", "BEGIN"),
                insert_event(LOG1, 200, &table(), person(1, "a")),
            ],
        );
        let mut config = config(LOG1);
        config.annotate_positions = true;

        let (_, _, sink) = run(config, server, RecordingSink::default()).await;
        let expected_time = event_time(Some(TS)).format(DATETIME_FORMAT).to_string();
        assert_eq!(
            sink.executed,
            vec![format!(
                "INSERT INTO `s`.`t`(`id`, `name`) VALUES (1, 'a'); #start 4 end 200 time {}",
                expected_time
            )]
        );
    }

    #[tokio::test]
    async fn test_replication_identity() {
        let mut server = MockServer::new(&[LOG1], Vec::new());
        server.server_id = None;
        let mut driver =
            StreamDriver::new(config(LOG1), server, RecordingSink::default(), MapperRegistry::identity()).unwrap();
        assert!(matches!(driver.run().await, Err(CdcError::ConfigurationError(_))));

        // 복제용 id를 지정해도 원본 서버 확인은 생략하지 않음
        let mut server = MockServer::new(&[LOG1], Vec::new());
        server.server_id = None;
        let mut overridden = config(LOG1);
        overridden.replica_server_id = Some(4242);
        let mut driver =
            StreamDriver::new(overridden.clone(), server, RecordingSink::default(), MapperRegistry::identity()).unwrap();
        assert!(matches!(driver.run().await, Err(CdcError::ConfigurationError(_))));

        let (_, server, _) = run(overridden, MockServer::new(&[LOG1], Vec::new()), RecordingSink::default()).await;
        assert_eq!(server.last_request.map(|r| r.server_id), Some(4242));

        let (_, server, _) = run(config(LOG1), MockServer::new(&[LOG1], Vec::new()), RecordingSink::default()).await;
        assert_eq!(server.last_request.map(|r| r.server_id), Some(1));
    }

    #[tokio::test]
    async fn test_start_file_must_exist_on_server() {
        let server = MockServer::new(&[LOG2], Vec::new());
        let mut driver =
            StreamDriver::new(config(LOG1), server, RecordingSink::default(), MapperRegistry::identity()).unwrap();
        assert!(matches!(driver.run().await, Err(CdcError::ConfigurationError(_))));
    }

    #[test]
    fn test_invalid_option_combination_rejected() {
        let mut config = config(LOG1);
        config.flashback = true;
        config.stop_never = true;
        let result = StreamDriver::new(
            config,
            MockServer::new(&[LOG1], Vec::new()),
            RecordingSink::default(),
            MapperRegistry::identity(),
        );
        assert!(matches!(result, Err(CdcError::ConfigurationError(_))));
    }
}
