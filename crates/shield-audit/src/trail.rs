use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use shield_core::{Metadata, Status, ValidationResult};

use crate::entry::{AuditEntry, AuditQuery};
use crate::store::{AuditError, AuditStore, FileStore, GzipFileStore, ReadOnlyStore};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    pub path: PathBuf,
    /// Entries held in memory before an automatic flush. 0 or 1 writes through.
    pub buffer_size: usize,
    /// fsync the log after every flush and batch.
    pub sync_on_flush: bool,
    /// Write gzip members to `<path>.gz` instead of plain lines.
    pub compress: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("audit.jsonl"), buffer_size: 100, sync_on_flush: true, compress: false }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditOverrides {
    pub path: Option<PathBuf>,
    pub buffer_size: Option<usize>,
    pub sync_on_flush: Option<bool>,
    pub compress: Option<bool>,
}

impl AuditConfig {
    pub fn merged(&self, o: &AuditOverrides) -> Self {
        Self {
            path: o.path.clone().unwrap_or_else(|| self.path.clone()),
            buffer_size: o.buffer_size.unwrap_or(self.buffer_size),
            sync_on_flush: o.sync_on_flush.unwrap_or(self.sync_on_flush),
            compress: o.compress.unwrap_or(self.compress),
        }
    }

    /// True when `compress` is set or `path` already ends in `.gz`.
    pub fn is_compressed(&self) -> bool {
        self.compress || is_gzip_path(&self.path)
    }

    /// The file actually written: `path`, with `.gz` appended when compressing.
    pub fn file_path(&self) -> PathBuf {
        if self.compress && !is_gzip_path(&self.path) {
            let mut name = self.path.clone().into_os_string();
            name.push(".gz");
            PathBuf::from(name)
        } else {
            self.path.clone()
        }
    }
}

pub fn is_gzip_path(path: &Path) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case("gz"))
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AuditStats {
    pub total: usize,
    pub by_status: BTreeMap<Status, usize>,
    pub total_errors: usize,
    pub total_warnings: usize,
    pub avg_duration_ms: Option<f64>,
    /// Unparsable lines skipped in the middle of the log.
    pub corrupt_lines: usize,
}

/// Buffered, append-only audit log.
///
/// Appends are serialized through one lock, so concurrent `log` calls land as
/// whole lines in the order they completed. Reads always go back to the store.
pub struct AuditTrail {
    config: AuditConfig,
    store: Box<dyn AuditStore>,
    buffer: Mutex<Vec<AuditEntry>>,
}

impl AuditTrail {
    /// Opens (or creates) the log at `config.file_path()`.
    pub fn open(config: AuditConfig) -> Result<Self, AuditError> {
        let path = config.file_path();
        let store: Box<dyn AuditStore> = if config.is_compressed() {
            Box::new(GzipFileStore::open(path)?)
        } else {
            Box::new(FileStore::open(path)?)
        };
        Ok(Self::with_store(config, store))
    }

    /// Opens an existing log for `query` and `stats` only. The file is never
    /// created or opened for writing; `log` fails with `AuditError::ReadOnly`.
    pub fn open_read_only(config: AuditConfig) -> Self {
        let store = ReadOnlyStore::new(config.file_path(), config.is_compressed());
        Self::with_store(config, Box::new(store))
    }

    pub fn with_store(config: AuditConfig, store: Box<dyn AuditStore>) -> Self {
        Self { config, store, buffer: Mutex::new(vec![]) }
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }

    /// Records `result`. The entry is buffered and written once the buffer is
    /// full.
    ///
    /// `AuditError::FlushPending` means the entry was queued but the write failed;
    /// it stays buffered for the next `flush`. Entries JSON cannot represent are
    /// rejected before they are queued.
    pub fn log(&self, result: &ValidationResult, extra: Option<&Metadata>) -> Result<AuditEntry, AuditError> {
        let entry = AuditEntry::from_result(result, extra);
        entry.check_encodable()?;
        let mut buf = self.buffer.lock().map_err(|_| AuditError::Poisoned)?;
        buf.push(entry.clone());
        if buf.len() >= self.config.buffer_size.max(1) {
            if let Err(e) = self.flush_locked(&mut buf) {
                return Err(AuditError::FlushPending { pending: buf.len(), source: Box::new(e) });
            }
        }
        Ok(entry)
    }

    /// Writes each result in order, bypassing the buffer.
    ///
    /// On failure, `AuditError::BatchIncomplete` carries the entries already
    /// written; nothing from `failed_index` onward was recorded.
    pub fn log_batch(&self, results: &[ValidationResult]) -> Result<Vec<AuditEntry>, AuditError> {
        let mut buf = self.buffer.lock().map_err(|_| AuditError::Poisoned)?;
        self.flush_locked(&mut buf)?;

        let mut written = Vec::with_capacity(results.len());
        for (i, r) in results.iter().enumerate() {
            let entry = AuditEntry::from_result(r, None);
            if let Err(e) = self.append_entry(&entry) {
                warn!(failed_index = i, written = written.len(), error = %e, "audit batch interrupted");
                if let Err(sync_err) = self.store.sync() {
                    warn!(error = %sync_err, "sync after failed batch append");
                }
                return Err(AuditError::BatchIncomplete { written, failed_index: i, source: Box::new(e) });
            }
            written.push(entry);
        }
        if self.config.sync_on_flush {
            self.store.sync()?;
        }
        debug!(count = written.len(), "audit batch written");
        Ok(written)
    }

    /// Writes buffered entries and returns how many were written.
    pub fn flush(&self) -> Result<usize, AuditError> {
        let mut buf = self.buffer.lock().map_err(|_| AuditError::Poisoned)?;
        self.flush_locked(&mut buf)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }

    fn flush_locked(&self, buf: &mut Vec<AuditEntry>) -> Result<usize, AuditError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let failure = buf
            .iter()
            .enumerate()
            .find_map(|(i, e)| self.append_entry(e).err().map(|err| (i, err)));
        if let Some((i, err)) = failure {
            buf.drain(..i);
            warn!(written = i, pending = buf.len(), error = %err, "audit flush failed");
            return Err(err);
        }
        let n = buf.len();
        buf.clear();
        if self.config.sync_on_flush {
            self.store.sync()?;
        }
        debug!(count = n, "audit entries flushed");
        Ok(n)
    }

    fn append_entry(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        entry.check_encodable()?;
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.store.append(&line)
    }

    /// Entries matching `q` in append order. Flushes first; every call re-reads the store.
    pub fn query(&self, q: &AuditQuery) -> Result<AuditIter, AuditError> {
        self.flush()?;
        Ok(AuditIter::new(self.store.open_reader()?, q.clone()))
    }

    /// Aggregates over a full scan of the log.
    pub fn stats(&self) -> Result<AuditStats, AuditError> {
        let mut stats = AuditStats {
            by_status: Status::ALL.iter().map(|s| (*s, 0)).collect(),
            ..Default::default()
        };
        let mut duration_sum = 0.0;
        let mut timed = 0usize;

        let mut it = self.query(&AuditQuery::default())?;
        for entry in it.by_ref() {
            let entry = entry?;
            stats.total += 1;
            *stats.by_status.entry(entry.status).or_default() += 1;
            stats.total_errors += entry.error_count();
            stats.total_warnings += entry.warning_count();
            if let Some(d) = entry.duration_ms {
                duration_sum += d;
                timed += 1;
            }
        }
        stats.corrupt_lines = it.corrupt_lines();
        if timed > 0 {
            stats.avg_duration_ms = Some(duration_sum / timed as f64);
        }
        Ok(stats)
    }
}

impl Drop for AuditTrail {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, store = %self.store.describe(), "audit entries lost on drop");
        }
    }
}

/// Lazy reader over audit lines.
///
/// An unparsable last line is treated as the end of the log (a torn write).
/// Unparsable lines followed by more data are skipped and counted.
pub struct AuditIter {
    reader: Box<dyn BufRead + Send>,
    query: AuditQuery,
    peeked: Option<std::io::Result<Vec<u8>>>,
    yielded: usize,
    line_no: usize,
    corrupt: usize,
    done: bool,
}

impl AuditIter {
    fn new(reader: Box<dyn BufRead + Send>, query: AuditQuery) -> Self {
        Self { reader, query, peeked: None, yielded: 0, line_no: 0, corrupt: 0, done: false }
    }

    pub fn corrupt_lines(&self) -> usize {
        self.corrupt
    }

    fn read_raw(&mut self) -> Option<std::io::Result<Vec<u8>>> {
        loop {
            let mut buf = Vec::new();
            match self.reader.read_until(b'\n', &mut buf) {
                Ok(0) => return None,
                Ok(_) => {
                    self.line_no += 1;
                    if buf.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    return Some(Ok(buf));
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }

    fn next_line(&mut self) -> Option<std::io::Result<Vec<u8>>> {
        match self.peeked.take() {
            Some(line) => Some(line),
            None => self.read_raw(),
        }
    }

    fn at_end(&mut self) -> bool {
        match self.read_raw() {
            None => true,
            Some(next) => {
                self.peeked = Some(next);
                false
            }
        }
    }
}

impl Iterator for AuditIter {
    type Item = Result<AuditEntry, AuditError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.query.limit.is_some_and(|l| self.yielded >= l) {
            return None;
        }
        loop {
            let line = match self.next_line()? {
                Ok(line) => line,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };
            match serde_json::from_slice::<AuditEntry>(&line) {
                Ok(entry) => {
                    if self.query.matches(&entry) {
                        self.yielded += 1;
                        return Some(Ok(entry));
                    }
                }
                Err(e) => {
                    let line_no = self.line_no;
                    if self.at_end() {
                        debug!(line = line_no, "ignoring truncated final audit line");
                        self.done = true;
                        return None;
                    }
                    self.corrupt += 1;
                    warn!(line = line_no, error = %e, "skipping unparsable audit line");
                }
            }
        }
    }
}
