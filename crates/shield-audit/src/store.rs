use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use tracing::warn;

use crate::entry::AuditEntry;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit entry encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("audit lock poisoned")]
    Poisoned,
    #[error("audit log {} is opened read-only", .0.display())]
    ReadOnly(PathBuf),
    /// The entry was accepted and is still buffered; call `flush` to retry. Logging it again duplicates it.
    #[error("entry queued but flush failed with {pending} entries pending: {source}")]
    FlushPending { pending: usize, source: Box<AuditError> },
    #[error("batch append stopped at entry {failed_index} after {} entries were written: {source}", .written.len())]
    BatchIncomplete {
        /// Entries durably appended before the failure, in input order.
        written: Vec<AuditEntry>,
        failed_index: usize,
        source: Box<AuditError>,
    },
}

/// Durable line storage behind the audit trail.
///
/// `append` receives one complete, newline-terminated line and must never
/// interleave it with another append.
pub trait AuditStore: Send + Sync {
    fn append(&self, line: &[u8]) -> Result<(), AuditError>;
    fn sync(&self) -> Result<(), AuditError>;
    /// Fresh reader positioned at the start of the log.
    fn open_reader(&self) -> Result<Box<dyn BufRead + Send>, AuditError>;
    fn describe(&self) -> String;
}

/// JSON-lines file opened in append mode.
pub struct FileStore {
    path: PathBuf,
    state: Mutex<FileState>,
}

struct FileState {
    file: File,
    /// Set when the file may end in a partial line; the next append starts a fresh one.
    needs_newline: bool,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let needs_newline = ends_mid_line(&path)?;
        if needs_newline {
            warn!(path = %path.display(), "audit log ends with a partial line");
        }
        Ok(Self { path, state: Mutex::new(FileState { file, needs_newline }) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn ends_mid_line(path: &Path) -> std::io::Result<bool> {
    let mut f = File::open(path)?;
    let len = f.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    f.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    f.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

impl AuditStore for FileStore {
    fn append(&self, line: &[u8]) -> Result<(), AuditError> {
        let mut state = self.state.lock().map_err(|_| AuditError::Poisoned)?;
        if state.needs_newline {
            state.file.write_all(b"\n")?;
            state.needs_newline = false;
        }
        // One write per line keeps concurrent appenders from splitting each other's records.
        if let Err(e) = state.file.write_all(line) {
            state.needs_newline = true;
            return Err(e.into());
        }
        Ok(())
    }

    fn sync(&self) -> Result<(), AuditError> {
        let state = self.state.lock().map_err(|_| AuditError::Poisoned)?;
        state.file.sync_data()?;
        Ok(())
    }

    fn open_reader(&self) -> Result<Box<dyn BufRead + Send>, AuditError> {
        read_log(&self.path, false)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Opens a log for reading; a missing file reads as empty. Gzip logs are
/// decoded member by member, and a torn final member ends the stream.
pub fn read_log(path: &Path, compressed: bool) -> Result<Box<dyn BufRead + Send>, AuditError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Box::new(Cursor::new(Vec::new()))),
        Err(e) => return Err(e.into()),
    };
    if compressed {
        let decoder = MultiGzDecoder::new(BufReader::new(file));
        Ok(Box::new(BufReader::new(TornTail { inner: decoder, path: path.to_path_buf(), ended: false })))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Turns a decoding failure into end of stream.
struct TornTail<R> {
    inner: R,
    path: PathBuf,
    ended: bool,
}

impl<R: Read> Read for TornTail<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.ended {
            return Ok(0);
        }
        match self.inner.read(buf) {
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::UnexpectedEof
                        | std::io::ErrorKind::InvalidInput
                        | std::io::ErrorKind::InvalidData
                ) =>
            {
                warn!(path = %self.path.display(), error = %e, "compressed audit log ends early");
                self.ended = true;
                Ok(0)
            }
            other => other,
        }
    }
}

/// JSON-lines log where every appended line is its own gzip member, so a
/// crash can only tear the last record.
///
/// A torn trailing member is cut off on open and after a failed append;
/// otherwise no later member could be decoded.
pub struct GzipFileStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl GzipFileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        cut_torn_member(&path, &file)?;
        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Byte length of the leading run of complete gzip members in `bytes`.
fn complete_members_len(bytes: &[u8]) -> usize {
    let mut rest = bytes;
    let mut sink = Vec::new();
    while !rest.is_empty() {
        let mut member = flate2::bufread::GzDecoder::new(rest);
        sink.clear();
        if member.read_to_end(&mut sink).is_err() {
            break;
        }
        rest = member.into_inner();
    }
    bytes.len() - rest.len()
}

fn cut_torn_member(path: &Path, file: &File) -> std::io::Result<()> {
    let bytes = std::fs::read(path)?;
    let valid = complete_members_len(&bytes);
    if valid < bytes.len() {
        warn!(path = %path.display(), dropped_bytes = bytes.len() - valid, "cutting torn gzip member from audit log");
        file.set_len(valid as u64)?;
    }
    Ok(())
}

impl AuditStore for GzipFileStore {
    fn append(&self, line: &[u8]) -> Result<(), AuditError> {
        let mut enc = GzEncoder::new(Vec::with_capacity(line.len() / 2 + 32), Compression::default());
        enc.write_all(line)?;
        let member = enc.finish()?;

        let mut file = self.file.lock().map_err(|_| AuditError::Poisoned)?;
        if let Err(e) = file.write_all(&member) {
            if let Err(cut) = cut_torn_member(&self.path, &file) {
                warn!(path = %self.path.display(), error = %cut, "could not repair audit log after failed append");
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn sync(&self) -> Result<(), AuditError> {
        let file = self.file.lock().map_err(|_| AuditError::Poisoned)?;
        file.sync_data()?;
        Ok(())
    }

    fn open_reader(&self) -> Result<Box<dyn BufRead + Send>, AuditError> {
        read_log(&self.path, true)
    }

    fn describe(&self) -> String {
        format!("{} (gzip)", self.path.display())
    }
}

/// Reads an existing log without opening it for writing. Appends fail with
/// `AuditError::ReadOnly`.
pub struct ReadOnlyStore {
    path: PathBuf,
    compressed: bool,
}

impl ReadOnlyStore {
    pub fn new(path: impl Into<PathBuf>, compressed: bool) -> Self {
        Self { path: path.into(), compressed }
    }
}

impl AuditStore for ReadOnlyStore {
    fn append(&self, _line: &[u8]) -> Result<(), AuditError> {
        Err(AuditError::ReadOnly(self.path.clone()))
    }

    fn sync(&self) -> Result<(), AuditError> {
        Ok(())
    }

    fn open_reader(&self) -> Result<Box<dyn BufRead + Send>, AuditError> {
        read_log(&self.path, self.compressed)
    }

    fn describe(&self) -> String {
        format!("{} (read-only)", self.path.display())
    }
}

/// In-memory store for tests. Not durable.
#[derive(Default)]
pub struct MemoryStore {
    bytes: Mutex<Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Result<Vec<u8>, AuditError> {
        Ok(self.bytes.lock().map_err(|_| AuditError::Poisoned)?.clone())
    }
}

impl AuditStore for MemoryStore {
    fn append(&self, line: &[u8]) -> Result<(), AuditError> {
        self.bytes.lock().map_err(|_| AuditError::Poisoned)?.extend_from_slice(line);
        Ok(())
    }

    fn sync(&self) -> Result<(), AuditError> {
        Ok(())
    }

    fn open_reader(&self) -> Result<Box<dyn BufRead + Send>, AuditError> {
        Ok(Box::new(Cursor::new(self.contents()?)))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_store_appends_and_reads_back() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().join("nested/audit.jsonl")).unwrap();
        store.append(b"{\"a\":1}\n").unwrap();
        store.append(b"{\"a\":2}\n").unwrap();
        store.sync().unwrap();
        let lines: Vec<String> = store.open_reader().unwrap().lines().map(|l| l.unwrap()).collect();
        assert_eq!(lines, vec!["{\"a\":1}", "{\"a\":2}"]);
    }

    #[test]
    fn reopening_a_torn_log_starts_a_new_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        std::fs::write(&path, "{\"a\":1}\n{\"a\":").unwrap();
        let store = FileStore::open(&path).unwrap();
        store.append(b"{\"a\":3}\n").unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "{\"a\":1}\n{\"a\":\n{\"a\":3}\n");
    }

    #[test]
    fn gzip_store_writes_one_member_per_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl.gz");
        let store = GzipFileStore::open(&path).unwrap();
        store.append(b"{\"a\":1}\n").unwrap();
        store.append(b"{\"a\":2}\n").unwrap();
        store.sync().unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[..2], &[0x1f, 0x8b]);
        assert_eq!(complete_members_len(&raw), raw.len());
        let lines: Vec<String> = store.open_reader().unwrap().lines().map(|l| l.unwrap()).collect();
        assert_eq!(lines, vec!["{\"a\":1}", "{\"a\":2}"]);
    }

    #[test]
    fn torn_gzip_member_is_cut_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl.gz");
        {
            let store = GzipFileStore::open(&path).unwrap();
            store.append(b"{\"a\":1}\n").unwrap();
            store.append(b"{\"a\":2}\n").unwrap();
        }
        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() - 6]).unwrap();

        let lines: Vec<String> = read_log(&path, true).unwrap().lines().map(|l| l.unwrap()).collect();
        assert_eq!(lines[0], "{\"a\":1}");

        let store = GzipFileStore::open(&path).unwrap();
        store.append(b"{\"a\":3}\n").unwrap();
        let lines: Vec<String> = store.open_reader().unwrap().lines().map(|l| l.unwrap()).collect();
        assert_eq!(lines, vec!["{\"a\":1}", "{\"a\":3}"]);
    }

    #[test]
    fn read_only_store_never_creates_or_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.jsonl");
        let store = ReadOnlyStore::new(&path, false);
        assert_eq!(store.open_reader().unwrap().lines().count(), 0);
        assert!(matches!(store.append(b"x\n"), Err(AuditError::ReadOnly(_))));
        assert!(!path.exists());
    }

    #[test]
    fn memory_store_reader_is_a_snapshot() {
        let store = MemoryStore::new();
        store.append(b"x\n").unwrap();
        let mut reader = store.open_reader().unwrap();
        store.append(b"y\n").unwrap();
        let mut s = String::new();
        reader.read_to_string(&mut s).unwrap();
        assert_eq!(s, "x\n");
    }
}
