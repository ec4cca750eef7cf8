//! 롤백 SQL 파일 및 역순 출력
//!
//! 스트리밍 중에는 롤백 문장을 한 줄씩 파일에 덧붙이고, 스트림이 끝나면
//! 파일을 끝에서부터 4096 바이트 블록 단위로 거꾸로 읽어 마지막 줄부터 출력합니다.
//! 파일 전체를 메모리에 올리지 않습니다.
//!
//! 블록 경계에 걸친 줄(멀티바이트 문자 포함)은 바이트 단위로 이어 붙인 뒤
//! 줄이 완성되었을 때만 UTF-8로 디코딩합니다.

use crate::error::{CdcError, Result};
use crate::sink::SqlSink;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 역방향 읽기 블록 크기
pub const BLOCK_SIZE: usize = 4096;

/// 동일 파일명 충돌 시 시도할 접미사 개수
pub const MAX_UNIQUE_ATTEMPTS: usize = 1000;

/// 파일의 줄을 마지막 줄부터 돌려주는 반복자
///
/// 읽기 커서 `here` 아래쪽 파일은 아직 읽지 않았고, `pending`은 `here`부터
/// 아직 돌려주지 않은 바이트입니다. `pending` 안의 마지막 개행 뒤쪽은 완성된 줄입니다.
pub struct ReverseLines<R> {
    reader: R,
    here: u64,
    block_size: usize,
    pending: Vec<u8>,
    finished: bool,
}

impl<R: Read + Seek> ReverseLines<R> {
    pub fn new(reader: R) -> io::Result<Self> {
        Self::with_block_size(reader, BLOCK_SIZE)
    }

    pub fn with_block_size(mut reader: R, block_size: usize) -> io::Result<Self> {
        let len = reader.seek(SeekFrom::End(0))?;
        let mut lines = ReverseLines {
            reader,
            here: len,
            block_size: block_size.max(1),
            pending: Vec::new(),
            finished: len == 0,
        };

        // 마지막 개행은 줄 구분자일 뿐 빈 줄이 아님
        if len > 0 {
            lines.read_block()?;
            if lines.pending.last() == Some(&b'\n') {
                lines.pending.pop();
            }
        }
        Ok(lines)
    }

    fn read_block(&mut self) -> io::Result<()> {
        let delta = (self.block_size as u64).min(self.here);
        self.here -= delta;
        self.reader.seek(SeekFrom::Start(self.here))?;

        let mut block = vec![0u8; delta as usize];
        self.reader.read_exact(&mut block)?;
        block.extend_from_slice(&self.pending);
        self.pending = block;
        Ok(())
    }

    fn next_line(&mut self) -> io::Result<Option<String>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            if let Some(idx) = self.pending.iter().rposition(|&b| b == b'\n') {
                let line = self.pending.split_off(idx + 1);
                self.pending.truncate(idx);
                return decode_line(line).map(Some);
            }
            if self.here == 0 {
                self.finished = true;
                return decode_line(std::mem::take(&mut self.pending)).map(Some);
            }
            self.read_block()?;
        }
    }
}

fn decode_line(mut bytes: Vec<u8>) -> io::Result<String> {
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

impl<R: Read + Seek> Iterator for ReverseLines<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_line() {
            Ok(Some(line)) => Some(Ok(line)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// 같은 이름의 파일이 있으면 `.0`, `.1`, ... 접미사를 붙인 경로
pub fn unique_path(base: &Path) -> Result<PathBuf> {
    if !base.exists() {
        return Ok(base.to_path_buf());
    }
    for version in 0..MAX_UNIQUE_ATTEMPTS {
        let mut candidate = base.as_os_str().to_owned();
        candidate.push(format!(".{}", version));
        let candidate = PathBuf::from(candidate);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(CdcError::ResourceError(format!(
        "고유한 롤백 파일을 만들 수 없습니다: {}.[0-{}]",
        base.display(),
        MAX_UNIQUE_ATTEMPTS - 1
    )))
}

/// 롤백 문장 저장 파일
///
/// 생성부터 출력까지 한 번의 실행이 독점하며, 어떤 경로로 끝나든 drop 시 삭제됩니다.
pub struct RollbackFile {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    lines: u64,
    removed: bool,
}

impl RollbackFile {
    pub fn create(base: &Path) -> Result<Self> {
        let path = unique_path(base)?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| CdcError::ResourceError(format!("{}: {}", path.display(), e)))?;
        debug!("Created rollback file {}", path.display());

        Ok(RollbackFile {
            path,
            writer: Some(BufWriter::new(file)),
            lines: 0,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// 완성된 문장 한 줄 추가. 개행이 들어간 문장은 거부합니다.
    pub fn append(&mut self, statement: &str) -> Result<()> {
        if statement.contains('\n') {
            return Err(CdcError::StreamIntegrityError(format!(
                "롤백 문장에 개행이 포함되어 있습니다: {}",
                statement
            )));
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| CdcError::ResourceError("롤백 파일이 이미 닫혔습니다".to_string()))?;
        writer.write_all(statement.as_bytes())?;
        writer.write_all(b"\n")?;
        self.lines += 1;
        Ok(())
    }

    /// 쓰기 종료 후 역순 읽기용으로 다시 열기
    pub fn reopen_reversed(&mut self) -> Result<ReverseLines<File>> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        let file = File::open(&self.path)?;
        Ok(ReverseLines::new(file)?)
    }

    /// 파일 삭제 (한 번만 수행)
    pub fn remove(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }
        self.writer = None;
        self.removed = true;
        std::fs::remove_file(&self.path)?;
        debug!("Removed rollback file {}", self.path.display());
        Ok(())
    }
}

impl Drop for RollbackFile {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!("Failed to remove rollback file {}: {}", self.path.display(), e);
        }
    }
}

/// 역순 출력 결과
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub lines: u64,
    pub pauses: u64,
    pub failures: u64,
}

/// 롤백 문장을 역순으로 배치 단위 출력
#[derive(Debug, Clone, Copy)]
pub struct FlashbackEmitter {
    batch_size: usize,
    pause_seconds: f64,
}

impl FlashbackEmitter {
    pub fn new(batch_size: usize, pause_seconds: f64) -> Self {
        FlashbackEmitter {
            batch_size: batch_size.max(1),
            pause_seconds,
        }
    }

    /// 배치 사이에 넣는 대기 문장
    pub fn pacing_directive(&self) -> Option<String> {
        (self.pause_seconds > 0.0).then(|| format!("SELECT SLEEP({});", self.pause_seconds))
    }

    /// 줄을 순서대로 싱크에 전달. `batch_size`줄마다 다음 줄 앞에 대기 문장을 넣습니다.
    ///
    /// 개별 문장 실행 실패는 기록만 하고 계속 진행합니다.
    pub async fn emit<I, K>(&self, lines: I, sink: &mut K) -> Result<DrainSummary>
    where
        I: IntoIterator<Item = io::Result<String>>,
        K: SqlSink + ?Sized,
    {
        let mut summary = DrainSummary::default();
        let directive = self.pacing_directive();

        for line in lines {
            let line = line?;
            if summary.lines > 0 && summary.lines % self.batch_size as u64 == 0 {
                if let Some(directive) = &directive {
                    summary.pauses += 1;
                    if !execute_and_commit(sink, directive).await? {
                        summary.failures += 1;
                    }
                }
            }
            summary.lines += 1;
            if !execute_and_commit(sink, line.trim_end()).await? {
                summary.failures += 1;
            }
        }

        Ok(summary)
    }

    /// 롤백 파일 전체를 역순 출력한 뒤 파일 삭제
    pub async fn drain<K>(&self, mut file: RollbackFile, sink: &mut K) -> Result<DrainSummary>
    where
        K: SqlSink + ?Sized,
    {
        info!(
            "Emitting {} rollback statements from {}",
            file.lines(),
            file.path().display()
        );
        let lines = file.reopen_reversed()?;
        let result = self.emit(lines, sink).await;
        file.remove()?;
        result
    }
}

/// 실행 성공 여부. 복구 가능한 실행 에러는 false, 그 외 에러는 전파
pub(crate) async fn execute_and_commit<K>(sink: &mut K, sql: &str) -> Result<bool>
where
    K: SqlSink + ?Sized,
{
    let result = match sink.execute(sql).await {
        Ok(()) => sink.commit().await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if !e.is_fatal() => {
            warn!("Statement failed: {} ({})", sql, e);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
