//! Durable state log and replay.
//!
//! The executor appends tagged items to a generational log under
//! `<rootDir>/_state/`; replay on startup makes restarts idempotent. Each
//! file opens with a magic/version header followed by length-prefixed JSON
//! records. Append order is preserved across generations; the recovery
//! protocol depends on it.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{fmt, io};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sfl_common::{AppId, AppShuffleId, MapTaskAttemptId, Result, SflError, ShuffleWriteConfig};
use tracing::warn;

use crate::stage::StageFileStatus;
use crate::writer::PartitionFilePathAndLength;

const STATE_FILE_MAGIC: &[u8; 4] = b"SFLS";
const STATE_FILE_VERSION: u32 = 1;
const STATE_FILE_HEADER_LEN: usize = 8;
// frames longer than this are assumed to be a corrupt tail
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// One durable record in the executor's append-only state log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateItem {
    /// Stage registration: written before any commit or corruption item for
    /// the same stage.
    StageInfo {
        app_shuffle_id: AppShuffleId,
        num_maps: i32,
        num_partitions: i32,
        file_start_index: i32,
        write_config: ShuffleWriteConfig,
        file_status: StageFileStatus,
    },
    /// Map attempts whose bytes are flushed, with the post-flush snapshot of
    /// every partition file.
    TaskAttemptCommit {
        app_shuffle_id: AppShuffleId,
        map_task_attempts: Vec<MapTaskAttemptId>,
        partition_files: Vec<PartitionFilePathAndLength>,
    },
    /// The stage's outputs must not be consumed.
    StageCorruption { app_shuffle_id: AppShuffleId },
    /// The application and all its stages were removed.
    AppDeletion { app_id: AppId },
}

/// Why replay stopped at or skipped one record.
#[derive(Debug)]
pub enum StateLoadError {
    /// Truncated trailing record; nothing past it is readable.
    Torn,
    /// A fully-framed record that does not decode; safe to skip.
    Decode(String),
}

impl fmt::Display for StateLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateLoadError::Torn => write!(f, "torn trailing record"),
            StateLoadError::Decode(reason) => write!(f, "undecodable record: {reason}"),
        }
    }
}

/// Summary of one startup replay, logged with the load duration.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StateStoreLoadResult {
    pub partial_load: bool,
    pub total_items: u64,
    pub num_apps: usize,
    pub num_deleted_apps: usize,
    pub num_stages: usize,
    pub num_corrupted_stages: usize,
    pub num_deleted_stages: usize,
}

impl fmt::Display for StateStoreLoadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "partial: {}, items: {}, apps: {}, deleted apps: {}, stages: {}, corrupted stages: {}, deleted stages: {}",
            self.partial_load,
            self.total_items,
            self.num_apps,
            self.num_deleted_apps,
            self.num_stages,
            self.num_corrupted_stages,
            self.num_deleted_stages
        )
    }
}

/// Append-only durable log of state items.
///
/// The executor is the only writer; there are no concurrent appenders. The
/// log preserves append order and `commit` is the durability barrier.
/// Implementations may compact on commit.
pub trait StateStore: Send + Sync {
    fn store(&self, item: &StateItem) -> Result<()>;

    fn commit(&self) -> Result<()>;

    /// One-shot forward iterator over everything appended before this store
    /// was opened, in append order.
    fn load_data(
        &self,
    ) -> Result<Box<dyn Iterator<Item = std::result::Result<StateItem, StateLoadError>> + Send>>;

    fn close(&self) -> Result<()>;
}

/// [`StateStore`] over generational files on local disk.
///
/// Every open starts a fresh generation file; `load_data` replays the older
/// generations. Once a load has consumed them fully, the next `commit`
/// deletes them — a partial load keeps them so unconsumed records survive a
/// further restart.
#[derive(Debug)]
pub struct LocalFileStateStore {
    dir: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    older_generations: Vec<PathBuf>,
    fully_loaded: Arc<AtomicBool>,
    compacted: AtomicBool,
}

impl LocalFileStateStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let older_generations = list_generation_files(&dir)?;
        let generation = older_generations
            .last()
            .and_then(|path| parse_generation(path))
            .map(|g| g + 1)
            .unwrap_or(0);

        let path = dir.join(format!("state-{generation:06}.log"));
        let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        let mut out = BufWriter::new(file);
        out.write_all(STATE_FILE_MAGIC)?;
        out.write_all(&STATE_FILE_VERSION.to_le_bytes())?;

        Ok(Self {
            dir,
            writer: Mutex::new(Some(out)),
            older_generations,
            fully_loaded: Arc::new(AtomicBool::new(false)),
            compacted: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl StateStore for LocalFileStateStore {
    fn store(&self, item: &StateItem) -> Result<()> {
        let payload = serde_json::to_vec(item)
            .map_err(|e| SflError::InvalidState(format!("state item encode failed: {e}")))?;
        let mut guard = self.writer.lock();
        let Some(out) = guard.as_mut() else {
            return Err(SflError::InvalidState(
                "state store already closed".to_string(),
            ));
        };
        out.write_all(&(payload.len() as u32).to_le_bytes())?;
        out.write_all(&payload)?;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        {
            let mut guard = self.writer.lock();
            if let Some(out) = guard.as_mut() {
                out.flush()?;
                out.get_ref().sync_data()?;
            }
        }
        if self.fully_loaded.load(Ordering::Acquire)
            && !self.compacted.swap(true, Ordering::AcqRel)
        {
            for path in &self.older_generations {
                if let Err(err) = fs::remove_file(path) {
                    if err.kind() != io::ErrorKind::NotFound {
                        warn!(path = %path.display(), error = %err, "failed to compact state file");
                    }
                }
            }
        }
        Ok(())
    }

    fn load_data(
        &self,
    ) -> Result<Box<dyn Iterator<Item = std::result::Result<StateItem, StateLoadError>> + Send>>
    {
        Ok(Box::new(LocalFileStateStoreIterator {
            files: self.older_generations.clone().into_iter(),
            current: None,
            done: false,
            fully_loaded: Arc::clone(&self.fully_loaded),
        }))
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.writer.lock();
        if let Some(mut out) = guard.take() {
            out.flush()?;
            out.get_ref().sync_data()?;
        }
        Ok(())
    }
}

fn list_generation_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| parse_generation(path).is_some())
        .collect();
    files.sort();
    Ok(files)
}

fn parse_generation(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix("state-")?
        .strip_suffix(".log")?
        .parse::<u64>()
        .ok()
}

/// One-shot replay over older generation files.
struct LocalFileStateStoreIterator {
    files: std::vec::IntoIter<PathBuf>,
    current: Option<BufReader<File>>,
    done: bool,
    fully_loaded: Arc<AtomicBool>,
}

enum Frame {
    Eof,
    Torn,
    Payload(Vec<u8>),
}

fn read_filled(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn read_frame(reader: &mut impl Read) -> Frame {
    let mut len_buf = [0u8; 4];
    match read_filled(reader, &mut len_buf) {
        Ok(0) => return Frame::Eof,
        Ok(4) => {}
        _ => return Frame::Torn,
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Frame::Torn;
    }
    let mut payload = vec![0u8; len as usize];
    match read_filled(reader, &mut payload) {
        Ok(filled) if filled == payload.len() => Frame::Payload(payload),
        _ => Frame::Torn,
    }
}

impl LocalFileStateStoreIterator {
    /// Open the next generation file, skipping empty ones. `None` once all
    /// files are consumed, `Some(Err)` on a bad or truncated header.
    fn open_next_file(&mut self) -> Option<std::result::Result<(), StateLoadError>> {
        loop {
            let path = self.files.next()?;
            let file = match File::open(&path) {
                Ok(file) => file,
                Err(err) => {
                    return Some(Err(StateLoadError::Decode(format!(
                        "cannot open state file {}: {err}",
                        path.display()
                    ))));
                }
            };
            let mut reader = BufReader::new(file);
            let mut header = [0u8; STATE_FILE_HEADER_LEN];
            match read_filled(&mut reader, &mut header) {
                Ok(0) => continue,
                Ok(n) if n == STATE_FILE_HEADER_LEN => {}
                _ => return Some(Err(StateLoadError::Torn)),
            }
            if &header[..4] != STATE_FILE_MAGIC {
                return Some(Err(StateLoadError::Decode(format!(
                    "bad state file magic in {}",
                    path.display()
                ))));
            }
            let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            if version != STATE_FILE_VERSION {
                return Some(Err(StateLoadError::Decode(format!(
                    "unsupported state file version {version} in {}",
                    path.display()
                ))));
            }
            self.current = Some(reader);
            return Some(Ok(()));
        }
    }
}

impl Iterator for LocalFileStateStoreIterator {
    type Item = std::result::Result<StateItem, StateLoadError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let Some(reader) = self.current.as_mut() else {
                match self.open_next_file() {
                    Some(Ok(())) => continue,
                    Some(Err(StateLoadError::Torn)) => {
                        self.done = true;
                        return Some(Err(StateLoadError::Torn));
                    }
                    Some(Err(err)) => return Some(Err(err)),
                    None => {
                        self.done = true;
                        self.fully_loaded.store(true, Ordering::Release);
                        return None;
                    }
                }
            };
            match read_frame(reader) {
                Frame::Eof => {
                    self.current = None;
                }
                Frame::Torn => {
                    self.done = true;
                    return Some(Err(StateLoadError::Torn));
                }
                Frame::Payload(payload) => {
                    return Some(match serde_json::from_slice(&payload) {
                        Ok(item) => Ok(item),
                        Err(err) => Err(StateLoadError::Decode(err.to_string())),
                    });
                }
            }
        }
    }
}
