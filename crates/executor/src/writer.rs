use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sfl_common::{Result, SflError};

use crate::storage::ShuffleStorage;

/// One on-disk partition file with the byte count that has survived a flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePathAndLength {
    pub path: String,
    pub length: u64,
}

/// [`FilePathAndLength`] qualified with its reduce partition, as recorded in
/// commit log items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionFilePathAndLength {
    pub partition: i32,
    pub path: String,
    pub length: u64,
}

/// Appender for one `(stage, partition)` pair.
///
/// The partition's bytes are spread over `num_splits` append files; an
/// attempt always lands in the split chosen by its task attempt id, so
/// appends from one attempt stay contiguous per file. `write_data` takes
/// ownership of the incoming buffer: the writer consumes it on success and
/// drops it on failure, so it is released exactly once either way.
///
/// Appends to one split are serialized by the split lock. `flush` is the
/// synchronization point: once it returns, every earlier `write_data` on this
/// writer is persisted and counted in `persisted_length`.
pub struct ShufflePartitionWriter {
    partition: i32,
    fsync: bool,
    storage: Arc<dyn ShuffleStorage>,
    splits: Vec<Mutex<SplitFile>>,
}

#[derive(Debug)]
struct SplitFile {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    written_bytes: u64,
    persisted_bytes: u64,
    closed: bool,
}

impl SplitFile {
    fn write(&mut self, storage: &Arc<dyn ShuffleStorage>, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(SflError::InvalidState(format!(
                "partition file already closed: {}",
                self.path.display()
            )));
        }
        if self.out.is_none() {
            if let Some(parent) = self.path.parent() {
                storage.create_dir_all(parent)?;
            }
            self.out = Some(BufWriter::new(storage.open_append(&self.path)?));
        }
        if let Some(out) = self.out.as_mut() {
            out.write_all(bytes)?;
            self.written_bytes += bytes.len() as u64;
        }
        Ok(())
    }

    fn flush(&mut self, fsync: bool) -> Result<()> {
        if let Some(out) = self.out.as_mut() {
            out.flush()?;
            if fsync {
                out.get_ref().sync_data()?;
            }
            self.persisted_bytes = self.written_bytes;
        }
        Ok(())
    }

    fn close(&mut self, fsync: bool) -> Result<()> {
        let result = self.flush(fsync);
        self.out = None;
        self.closed = true;
        result
    }
}

impl ShufflePartitionWriter {
    pub fn new(
        partition: i32,
        split_paths: Vec<PathBuf>,
        fsync: bool,
        storage: Arc<dyn ShuffleStorage>,
    ) -> Self {
        let splits = split_paths
            .into_iter()
            .map(|path| {
                Mutex::new(SplitFile {
                    path,
                    out: None,
                    written_bytes: 0,
                    persisted_bytes: 0,
                    closed: false,
                })
            })
            .collect();
        Self {
            partition,
            fsync,
            storage,
            splits,
        }
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Append one block for the given attempt, taking ownership of the bytes.
    pub fn write_data(&self, task_attempt_id: i64, bytes: Bytes) -> Result<usize> {
        let split = (task_attempt_id.unsigned_abs() % self.splits.len() as u64) as usize;
        let mut file = self.splits[split].lock();
        file.write(&self.storage, &bytes)?;
        Ok(bytes.len())
    }

    /// Push buffered bytes to the OS, fsyncing when enabled; returns only
    /// after completion.
    pub fn flush(&self) -> Result<()> {
        for split in &self.splits {
            split.lock().flush(self.fsync)?;
        }
        Ok(())
    }

    /// Flush then release every file handle. Idempotent; a closed writer
    /// rejects further appends.
    pub fn close(&self) -> Result<()> {
        let mut first_err = None;
        for split in &self.splits {
            if let Err(err) = split.lock().close(self.fsync) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.splits.iter().any(|split| split.lock().out.is_some())
    }

    /// Total bytes across splits that have passed at least one flush.
    pub fn persisted_length(&self) -> u64 {
        self.splits
            .iter()
            .map(|split| split.lock().persisted_bytes)
            .sum()
    }

    /// Per-file persisted lengths for every split that received data.
    pub fn persisted_file_snapshot(&self) -> Vec<FilePathAndLength> {
        self.splits
            .iter()
            .filter_map(|split| {
                let split = split.lock();
                if split.written_bytes == 0 {
                    return None;
                }
                Some(FilePathAndLength {
                    path: split.path.to_string_lossy().to_string(),
                    length: split.persisted_bytes,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use bytes::Bytes;

    use crate::storage::{LocalShuffleStorage, ShuffleStorage};

    use super::ShufflePartitionWriter;

    fn temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("{prefix}_{nanos}"))
    }

    fn writer_with_splits(dir: &PathBuf, splits: usize) -> ShufflePartitionWriter {
        let storage: Arc<dyn ShuffleStorage> = Arc::new(LocalShuffleStorage);
        let paths = (0..splits)
            .map(|i| dir.join(format!("part-0-{i}.data")))
            .collect();
        ShufflePartitionWriter::new(0, paths, false, storage)
    }

    #[test]
    fn persisted_length_counts_only_flushed_bytes() {
        let dir = temp_dir("sfl_writer_flush");
        let writer = writer_with_splits(&dir, 1);

        writer.write_data(1, Bytes::from_static(b"abc")).expect("write");
        assert_eq!(writer.persisted_length(), 0);

        writer.flush().expect("flush");
        assert_eq!(writer.persisted_length(), 3);

        writer.write_data(1, Bytes::from_static(b"de")).expect("write");
        assert_eq!(writer.persisted_length(), 3);
        writer.flush().expect("flush");
        assert_eq!(writer.persisted_length(), 5);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn attempts_route_to_splits_by_attempt_id() {
        let dir = temp_dir("sfl_writer_splits");
        let writer = writer_with_splits(&dir, 2);

        writer.write_data(2, Bytes::from_static(b"even")).expect("write");
        writer.write_data(3, Bytes::from_static(b"odd")).expect("write");
        writer.flush().expect("flush");

        let snapshot = writer.persisted_file_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].length, 4);
        assert_eq!(snapshot[1].length, 3);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn close_is_idempotent_and_rejects_later_writes() {
        let dir = temp_dir("sfl_writer_close");
        let writer = writer_with_splits(&dir, 1);

        writer.write_data(1, Bytes::from_static(b"abc")).expect("write");
        writer.close().expect("close");
        assert!(!writer.is_open());
        assert_eq!(writer.persisted_length(), 3);
        writer.close().expect("close again");

        assert!(writer.write_data(1, Bytes::from_static(b"x")).is_err());
        assert_eq!(writer.persisted_length(), 3);

        let _ = std::fs::remove_dir_all(dir);
    }
}
