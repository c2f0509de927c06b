//! Per-stage state machine: attempt lifecycle, lazy partition writers, the
//! pending-flush queue, commit accounting, and the absorbing corruption flag.
//!
//! Locking: every mutable field lives behind one per-stage mutex. Single-step
//! operations lock internally; multi-step protocols (finish-upload drain,
//! flush-and-commit, shutdown drain, load-time repair) take [`ShuffleStageState::lock`]
//! once and run against the guard so their steps observe one consistent state.
//! The guard must never be held across a state-store `commit` call.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use sfl_common::{AppShuffleId, AppTaskAttemptId, Result, SflError, ShuffleWriteConfig};
use tracing::info;

use crate::storage::{self, ShuffleStorage};
use crate::writer::{FilePathAndLength, PartitionFilePathAndLength, ShufflePartitionWriter};

/// Health of a stage's on-disk output as observed by status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageFileStatus {
    /// Files are consistent with the committed attempts.
    Ok,
    /// The stage's outputs must not be consumed. Absorbing.
    Corrupted,
    /// Sentinel for status queries against a stage nobody registered.
    NotStarted,
}

/// Snapshot of stage health plus the committed attempt per map task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleStageStatus {
    pub file_status: StageFileStatus,
    pub num_maps: i32,
    pub committed_attempts: BTreeMap<i32, i64>,
}

impl ShuffleStageStatus {
    pub fn not_started() -> Self {
        Self {
            file_status: StageFileStatus::NotStarted,
            num_maps: 0,
            committed_attempts: BTreeMap::new(),
        }
    }
}

/// Fields of a stage persisted in `StageInfo` log items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePersistentInfo {
    pub num_maps: i32,
    pub num_partitions: i32,
    pub file_start_index: i32,
    pub file_status: StageFileStatus,
}

/// State of one shuffle stage. `app_shuffle_id` and `write_config` are
/// immutable after creation; everything else is guarded by the per-stage
/// mutex.
pub struct ShuffleStageState {
    app_shuffle_id: AppShuffleId,
    write_config: ShuffleWriteConfig,
    inner: Mutex<StageStateInner>,
}

/// Mutable core of a stage, reachable through [`ShuffleStageState::lock`].
pub struct StageStateInner {
    num_maps: i32,
    num_partitions: i32,
    file_start_index: i32,
    corrupted: bool,
    writers: HashMap<i32, Arc<ShufflePartitionWriter>>,
    writers_closed: bool,
    latest_attempt_per_map: HashMap<i32, i64>,
    finished_uploads: HashSet<AppTaskAttemptId>,
    pending_flush: BTreeSet<AppTaskAttemptId>,
    committed: HashMap<i32, i64>,
    finalized_files: HashMap<i32, Vec<FilePathAndLength>>,
}

impl ShuffleStageState {
    pub fn new(app_shuffle_id: AppShuffleId, write_config: ShuffleWriteConfig) -> Self {
        Self::with_file_start_index(app_shuffle_id, write_config, 0)
    }

    pub fn with_file_start_index(
        app_shuffle_id: AppShuffleId,
        write_config: ShuffleWriteConfig,
        file_start_index: i32,
    ) -> Self {
        Self {
            app_shuffle_id,
            write_config,
            inner: Mutex::new(StageStateInner {
                num_maps: 0,
                num_partitions: 0,
                file_start_index,
                corrupted: false,
                writers: HashMap::new(),
                writers_closed: false,
                latest_attempt_per_map: HashMap::new(),
                finished_uploads: HashSet::new(),
                pending_flush: BTreeSet::new(),
                committed: HashMap::new(),
                finalized_files: HashMap::new(),
            }),
        }
    }

    pub fn app_shuffle_id(&self) -> &AppShuffleId {
        &self.app_shuffle_id
    }

    pub fn write_config(&self) -> &ShuffleWriteConfig {
        &self.write_config
    }

    /// Take the per-stage mutex for a multi-step protocol.
    pub fn lock(&self) -> MutexGuard<'_, StageStateInner> {
        self.inner.lock()
    }

    pub fn set_num_maps_partitions(&self, num_maps: i32, num_partitions: i32) {
        let mut inner = self.lock();
        inner.num_maps = num_maps;
        inner.num_partitions = num_partitions;
    }

    /// Check a repeat registration against the values the first caller set.
    /// Any conflict marks the stage corrupted and fails.
    pub fn verify_registration(
        &self,
        num_maps: i32,
        num_partitions: i32,
        write_config: &ShuffleWriteConfig,
    ) -> Result<()> {
        let mut inner = self.lock();
        if inner.num_maps != num_maps {
            inner.corrupted = true;
            return Err(SflError::StageCorrupted(format!(
                "mismatched numMaps ({} vs {}) for {}",
                num_maps, inner.num_maps, self.app_shuffle_id
            )));
        }
        if inner.num_partitions != num_partitions {
            inner.corrupted = true;
            return Err(SflError::StageCorrupted(format!(
                "mismatched numPartitions ({} vs {}) for {}",
                num_partitions, inner.num_partitions, self.app_shuffle_id
            )));
        }
        if &self.write_config != write_config {
            inner.corrupted = true;
            return Err(SflError::StageCorrupted(format!(
                "mismatched write config ({:?} vs {:?}) for {}",
                write_config, self.write_config, self.app_shuffle_id
            )));
        }
        Ok(())
    }

    /// Record the latest attempt seen starting upload for a map task; later
    /// attempts overwrite earlier ones.
    pub fn mark_start_upload(&self, attempt: &AppTaskAttemptId) {
        self.lock()
            .latest_attempt_per_map
            .insert(attempt.map_id(), attempt.task_attempt_id);
    }

    pub fn set_file_corrupted(&self) {
        self.lock().corrupted = true;
    }

    pub fn file_status(&self) -> StageFileStatus {
        self.lock().file_status()
    }

    pub fn status(&self) -> ShuffleStageStatus {
        let inner = self.lock();
        ShuffleStageStatus {
            file_status: inner.file_status(),
            num_maps: inner.num_maps,
            committed_attempts: inner.committed.iter().map(|(k, v)| (*k, *v)).collect(),
        }
    }

    pub fn persistent_info(&self) -> StagePersistentInfo {
        let inner = self.lock();
        StagePersistentInfo {
            num_maps: inner.num_maps,
            num_partitions: inner.num_partitions,
            file_start_index: inner.file_start_index,
            file_status: inner.file_status(),
        }
    }

    pub fn num_maps(&self) -> i32 {
        self.lock().num_maps
    }

    pub fn num_partitions(&self) -> i32 {
        self.lock().num_partitions
    }

    pub fn file_start_index(&self) -> i32 {
        self.lock().file_start_index
    }

    /// Advance the file start index past a prior run's files; never moves
    /// backwards.
    pub fn bump_file_start_index(&self, new_start_index: i32) {
        let mut inner = self.lock();
        if inner.file_start_index < new_start_index {
            let old = inner.file_start_index;
            inner.file_start_index = new_start_index;
            info!(
                stage = %self.app_shuffle_id,
                old_index = old,
                new_index = new_start_index,
                "bumped file start index"
            );
        }
    }

    pub fn get_or_create_writer(
        &self,
        partition: i32,
        root_dir: &Path,
        storage: &Arc<dyn ShuffleStorage>,
        fsync: bool,
        codec: Option<&str>,
    ) -> Result<Arc<ShufflePartitionWriter>> {
        self.lock().get_or_create_writer(
            &self.app_shuffle_id,
            &self.write_config,
            partition,
            root_dir,
            storage,
            fsync,
            codec,
        )
    }

    pub fn commit_map_task(&self, map_id: i32, task_attempt_id: i64) {
        self.lock().commit_map_task(map_id, task_attempt_id);
    }

    pub fn add_finalized_files(&self, files: Vec<PartitionFilePathAndLength>) {
        self.lock().add_finalized_files(files);
    }

    pub fn persisted_bytes_snapshot(&self, partition: i32) -> Vec<FilePathAndLength> {
        self.lock().persisted_bytes_snapshot(partition)
    }

    pub fn close_writers(&self) -> Result<()> {
        self.lock().close_writers()
    }

    pub fn close_writer(&self, partition: i32) -> Result<()> {
        let writer = { self.lock().writers.get(&partition).cloned() };
        match writer {
            Some(writer) => writer.close(),
            None => Ok(()),
        }
    }

    pub fn is_map_attempt_finished_upload(&self, attempt: &AppTaskAttemptId) -> bool {
        self.lock().finished_uploads.contains(attempt)
    }

    pub fn is_map_attempt_committed(&self, attempt: &AppTaskAttemptId) -> bool {
        self.lock().committed.get(&attempt.map_id()) == Some(&attempt.task_attempt_id)
    }

    pub fn num_opened_writers(&self) -> usize {
        self.lock()
            .writers
            .values()
            .filter(|writer| writer.is_open())
            .count()
    }
}

impl StageStateInner {
    pub fn file_status(&self) -> StageFileStatus {
        if self.corrupted {
            StageFileStatus::Corrupted
        } else {
            StageFileStatus::Ok
        }
    }

    pub fn set_file_corrupted(&mut self) {
        self.corrupted = true;
    }

    pub fn mark_finish_upload(&mut self, attempt: AppTaskAttemptId) {
        self.finished_uploads.insert(attempt);
    }

    pub fn add_pending_flush(&mut self, attempt: AppTaskAttemptId) {
        self.pending_flush.insert(attempt);
    }

    /// Drain and return every pending attempt; an empty result means the
    /// caller skips scheduling a flush.
    pub fn fetch_flush_map_attempts(&mut self) -> Vec<AppTaskAttemptId> {
        std::mem::take(&mut self.pending_flush).into_iter().collect()
    }

    /// Flush every live partition writer.
    pub fn flush_all_partitions(&self) -> Result<()> {
        for writer in self.writers.values() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Record a flush completion for a map task. Stale attempts are recorded
    /// too; only the latest attempt counts for
    /// [`StageStateInner::all_latest_task_attempts_committed`].
    pub fn commit_map_task(&mut self, map_id: i32, task_attempt_id: i64) {
        self.committed.insert(map_id, task_attempt_id);
    }

    /// True iff every map task's latest started attempt has a matching
    /// commit.
    pub fn all_latest_task_attempts_committed(&self) -> bool {
        (0..self.num_maps).all(|map_id| {
            match (
                self.latest_attempt_per_map.get(&map_id),
                self.committed.get(&map_id),
            ) {
                (Some(latest), Some(committed)) => latest == committed,
                _ => false,
            }
        })
    }

    /// Close all partition writers; idempotent. Closed writers cannot be
    /// reopened within the stage.
    pub fn close_writers(&mut self) -> Result<()> {
        self.writers_closed = true;
        let mut first_err = None;
        for writer in self.writers.values() {
            if let Err(err) = writer.close() {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn get_or_create_writer(
        &mut self,
        app_shuffle_id: &AppShuffleId,
        write_config: &ShuffleWriteConfig,
        partition: i32,
        root_dir: &Path,
        storage: &Arc<dyn ShuffleStorage>,
        fsync: bool,
        codec: Option<&str>,
    ) -> Result<Arc<ShufflePartitionWriter>> {
        if partition < 0 || partition >= self.num_partitions {
            return Err(SflError::InvalidState(format!(
                "partition {} out of range [0, {}) for {}",
                partition, self.num_partitions, app_shuffle_id
            )));
        }
        if self.writers_closed {
            return Err(SflError::InvalidState(format!(
                "partition writers already closed for {app_shuffle_id}"
            )));
        }
        if let Some(writer) = self.writers.get(&partition) {
            return Ok(Arc::clone(writer));
        }
        let dir = storage::stage_dir(root_dir, app_shuffle_id);
        let paths = (0..write_config.num_splits.max(1))
            .map(|split| {
                dir.join(storage::partition_file_name(
                    partition,
                    self.file_start_index + split as i32,
                    codec,
                ))
            })
            .collect();
        let writer = Arc::new(ShufflePartitionWriter::new(
            partition,
            paths,
            fsync,
            Arc::clone(storage),
        ));
        self.writers.insert(partition, Arc::clone(&writer));
        Ok(writer)
    }

    /// Files and persisted lengths for one partition: recovered finalized
    /// entries merged with live writer snapshots, lengths never shrinking.
    pub fn persisted_bytes_snapshot(&self, partition: i32) -> Vec<FilePathAndLength> {
        let mut out = self
            .finalized_files
            .get(&partition)
            .cloned()
            .unwrap_or_default();
        if let Some(writer) = self.writers.get(&partition) {
            for file in writer.persisted_file_snapshot() {
                match out.iter_mut().find(|entry| entry.path == file.path) {
                    Some(entry) => entry.length = entry.length.max(file.length),
                    None => out.push(file),
                }
            }
        }
        out
    }

    /// Snapshot across every partition that has data, for commit log items.
    pub fn persisted_bytes_snapshots(&self) -> Vec<PartitionFilePathAndLength> {
        let partitions: BTreeSet<i32> = self
            .finalized_files
            .keys()
            .chain(self.writers.keys())
            .copied()
            .collect();
        partitions
            .into_iter()
            .flat_map(|partition| {
                self.persisted_bytes_snapshot(partition)
                    .into_iter()
                    .map(move |file| PartitionFilePathAndLength {
                        partition,
                        path: file.path,
                        length: file.length,
                    })
            })
            .collect()
    }

    pub fn add_finalized_files(&mut self, files: Vec<PartitionFilePathAndLength>) {
        for file in files {
            let entries = self.finalized_files.entry(file.partition).or_default();
            match entries.iter_mut().find(|entry| entry.path == file.path) {
                Some(entry) => entry.length = entry.length.max(file.length),
                None => entries.push(FilePathAndLength {
                    path: file.path,
                    length: file.length,
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use sfl_common::{AppShuffleId, AppTaskAttemptId, ShuffleWriteConfig};

    use super::*;

    fn stage() -> ShuffleStageState {
        let state = ShuffleStageState::new(
            AppShuffleId::new("app-1", 1),
            ShuffleWriteConfig::default(),
        );
        state.set_num_maps_partitions(2, 3);
        state
    }

    fn attempt(state: &ShuffleStageState, map_id: i32, task_attempt_id: i64) -> AppTaskAttemptId {
        AppTaskAttemptId::new(state.app_shuffle_id().clone(), map_id, task_attempt_id)
    }

    #[test]
    fn registration_conflict_marks_corrupted() {
        let state = stage();
        assert!(state
            .verify_registration(2, 3, &ShuffleWriteConfig::default())
            .is_ok());
        assert!(state
            .verify_registration(5, 3, &ShuffleWriteConfig::default())
            .is_err());
        assert_eq!(state.file_status(), StageFileStatus::Corrupted);
        // absorbing
        assert!(state
            .verify_registration(2, 3, &ShuffleWriteConfig::default())
            .is_ok());
        assert_eq!(state.file_status(), StageFileStatus::Corrupted);
    }

    #[test]
    fn fetch_drains_pending_flush_in_order() {
        let state = stage();
        let a = attempt(&state, 1, 4);
        let b = attempt(&state, 0, 2);
        {
            let mut inner = state.lock();
            inner.add_pending_flush(a.clone());
            inner.add_pending_flush(b.clone());
            assert_eq!(inner.fetch_flush_map_attempts(), vec![b, a]);
            assert!(inner.fetch_flush_map_attempts().is_empty());
        }
    }

    #[test]
    fn only_latest_attempts_count_as_committed() {
        let state = stage();
        state.mark_start_upload(&attempt(&state, 0, 1));
        state.mark_start_upload(&attempt(&state, 0, 2));
        state.mark_start_upload(&attempt(&state, 1, 7));

        state.commit_map_task(0, 1);
        state.commit_map_task(1, 7);
        assert!(!state.lock().all_latest_task_attempts_committed());

        // superseding attempt commits; stale record remains but stops mattering
        state.commit_map_task(0, 2);
        assert!(state.lock().all_latest_task_attempts_committed());
        assert!(state.is_map_attempt_committed(&attempt(&state, 0, 2)));
        assert!(!state.is_map_attempt_committed(&attempt(&state, 0, 1)));
    }

    #[test]
    fn maps_without_started_attempts_block_commit_closure() {
        let state = stage();
        state.mark_start_upload(&attempt(&state, 0, 1));
        state.commit_map_task(0, 1);
        assert!(!state.lock().all_latest_task_attempts_committed());
    }

    #[test]
    fn finalized_files_merge_keeps_longest_length() {
        let state = stage();
        state.add_finalized_files(vec![PartitionFilePathAndLength {
            partition: 0,
            path: "p0".to_string(),
            length: 10,
        }]);
        state.add_finalized_files(vec![
            PartitionFilePathAndLength {
                partition: 0,
                path: "p0".to_string(),
                length: 4,
            },
            PartitionFilePathAndLength {
                partition: 0,
                path: "p0b".to_string(),
                length: 7,
            },
        ]);
        let snapshot = state.persisted_bytes_snapshot(0);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].length, 10);
        assert_eq!(snapshot[1].length, 7);
    }
}
