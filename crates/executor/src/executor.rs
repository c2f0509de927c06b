//! Executor orchestration.
//!
//! Responsibilities:
//! - route concurrent record streams to per-stage partition writers;
//! - refresh application liveness and enforce write-byte quotas;
//! - run the flush-then-commit protocol on a background scheduler;
//! - replay the state store on startup within a bounded time budget;
//! - expire idle applications and reclaim their storage.
//!
//! Locking discipline: the two top-level maps are concurrent and only see
//! lookup/insert/remove; every multi-step stage protocol holds that stage's
//! mutex. The mutex covers the state-store append but never the separate
//! `commit` durability barrier.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use sfl_common::{
    AppId, AppShuffleId, AppShufflePartitionId, AppTaskAttemptId, ExecutorConfig, MetricsRegistry,
    Result, SflError, ShuffleWriteConfig,
};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, warn};

use crate::app::{now_millis, AppState};
use crate::stage::{
    ShuffleStageState, ShuffleStageStatus, StageFileStatus, StageStateInner,
};
use crate::state::{
    LocalFileStateStore, StateItem, StateLoadError, StateStore, StateStoreLoadResult,
};
use crate::storage::{self, LocalShuffleStorage, ShuffleStorage};
use crate::writer::FilePathAndLength;

const MAX_STATE_LOAD_MILLIS: u64 = 30_000;
const EXPIRY_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(180);
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const STATE_DIR_NAME: &str = "_state";

/// One write operation routed from the ingest layer.
///
/// Ownership of `bytes` transfers to the executor for the duration of the
/// call; the partition writer consumes the buffer on success and it is
/// dropped on any failure path, so it is released exactly once.
#[derive(Debug)]
pub struct ShuffleWriteOp {
    pub app_shuffle_id: AppShuffleId,
    pub map_id: i32,
    pub task_attempt_id: i64,
    pub partition: i32,
    pub bytes: Bytes,
}

/// Single-node shuffle executor: coordinates concurrent record streams from
/// many map task attempts into a bounded set of partition files, enforcing
/// at-most-one effective attempt per map task.
pub struct ShuffleExecutor {
    config: ExecutorConfig,
    app_states: DashMap<AppId, Arc<AppState>>,
    stage_states: DashMap<AppShuffleId, Arc<ShuffleStageState>>,
    state_store: Arc<dyn StateStore>,
    storage: Arc<dyn ShuffleStorage>,
    metrics: MetricsRegistry,
    state_last_commit_ms: AtomicU64,
    runtime: Mutex<Option<Runtime>>,
}

impl ShuffleExecutor {
    /// Start an executor over local disk, recovering state from
    /// `<root_dir>/_state` and scheduling the periodic expiry task.
    pub fn start(config: ExecutorConfig) -> Result<Arc<Self>> {
        let state_store = Arc::new(LocalFileStateStore::open(
            config.root_dir.join(STATE_DIR_NAME),
        )?);
        Self::start_with(
            config,
            Arc::new(LocalShuffleStorage),
            state_store,
            sfl_common::global_metrics().clone(),
        )
    }

    /// Start with explicit storage, state store, and metrics sink.
    pub fn start_with(
        config: ExecutorConfig,
        storage: Arc<dyn ShuffleStorage>,
        state_store: Arc<dyn StateStore>,
        metrics: MetricsRegistry,
    ) -> Result<Arc<Self>> {
        info!(
            root_dir = %config.root_dir.display(),
            fsync_enabled = config.fsync_enabled,
            app_retention_millis = config.app_retention_millis,
            "starting shuffle executor"
        );

        let runtime = Builder::new_multi_thread()
            .worker_threads(config.flush_threads.max(1))
            .thread_name("sfl-executor")
            .enable_time()
            .build()?;

        let executor = Arc::new(Self {
            config,
            app_states: DashMap::new(),
            stage_states: DashMap::new(),
            state_store,
            storage,
            metrics,
            state_last_commit_ms: AtomicU64::new(0),
            runtime: Mutex::new(Some(runtime)),
        });

        executor.load_state_store();

        let weak = Arc::downgrade(&executor);
        if let Some(runtime) = executor.runtime.lock().as_ref() {
            runtime.spawn(async move {
                loop {
                    tokio::time::sleep(EXPIRY_INTERVAL).await;
                    let Some(executor) = weak.upgrade() else {
                        break;
                    };
                    executor.remove_expired_applications();
                }
            });
        }

        Ok(executor)
    }

    pub fn root_dir(&self) -> &Path {
        &self.config.root_dir
    }

    pub fn file_compression_codec(&self) -> Option<&str> {
        self.config.file_compression_codec.as_deref()
    }

    /// Register a shuffle stage. The first registration sets the stage
    /// schema and persists a `StageInfo` item; repeats must match exactly or
    /// the stage is marked corrupted.
    pub fn register_shuffle(
        &self,
        app_shuffle_id: &AppShuffleId,
        num_maps: i32,
        num_partitions: i32,
        write_config: ShuffleWriteConfig,
    ) -> Result<()> {
        if let Some(existing) = self.lookup_stage(app_shuffle_id) {
            return self.verify_registration(&existing, num_maps, num_partitions, &write_config);
        }

        let new_state = Arc::new(ShuffleStageState::new(
            app_shuffle_id.clone(),
            write_config.clone(),
        ));
        new_state.set_num_maps_partitions(num_maps, num_partitions);

        let raced = match self.stage_states.entry(app_shuffle_id.clone()) {
            Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&new_state));
                None
            }
        };
        match raced {
            Some(existing) => {
                self.verify_registration(&existing, num_maps, num_partitions, &write_config)
            }
            None => {
                // first registration: persist before any data path can begin
                self.state_store.store(&Self::stage_info_item(&new_state))?;
                Ok(())
            }
        }
    }

    fn verify_registration(
        &self,
        stage: &ShuffleStageState,
        num_maps: i32,
        num_partitions: i32,
        write_config: &ShuffleWriteConfig,
    ) -> Result<()> {
        match stage.verify_registration(num_maps, num_partitions, write_config) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.persist_stage_corruption(stage.app_shuffle_id());
                Err(err)
            }
        }
    }

    /// Refresh app liveness, enforce the quota, and record the attempt as
    /// the latest for its map task.
    pub fn start_upload(&self, attempt: &AppTaskAttemptId) -> Result<()> {
        debug!(attempt = %attempt, "start upload");
        let app_state = self.update_liveness(attempt.app_id());
        self.check_quota(attempt, app_state.num_write_bytes())?;
        let stage = self.stage_state(attempt.app_shuffle_id())?;
        stage.mark_start_upload(attempt);
        Ok(())
    }

    /// Append one block of record data. Any failure marks the stage
    /// corrupted, persists the corruption, and surfaces the error.
    pub fn write_data(&self, op: ShuffleWriteOp) -> Result<()> {
        let app_shuffle_id = op.app_shuffle_id.clone();
        match self.write_data_impl(op) {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(stage) = self.lookup_stage(&app_shuffle_id) {
                    stage.set_file_corrupted();
                    self.persist_stage_corruption(&app_shuffle_id);
                }
                warn!(
                    stage = %app_shuffle_id,
                    error = %err,
                    "set file corrupted during write"
                );
                Err(err)
            }
        }
    }

    fn write_data_impl(&self, op: ShuffleWriteOp) -> Result<()> {
        let ShuffleWriteOp {
            app_shuffle_id,
            map_id,
            task_attempt_id,
            partition,
            bytes,
        } = op;

        let app_state = self.app_state(&app_shuffle_id.app_id);
        app_state.update_liveness_timestamp();

        let attempt = AppTaskAttemptId::new(app_shuffle_id.clone(), map_id, task_attempt_id);
        let total_bytes = app_state.add_num_write_bytes(bytes.len() as u64);
        self.check_quota(&attempt, total_bytes)?;

        let stage = self.stage_state(&app_shuffle_id)?;
        let writer = stage.get_or_create_writer(
            partition,
            &self.config.root_dir,
            &self.storage,
            self.config.fsync_enabled,
            self.config.file_compression_codec.as_deref(),
        )?;
        writer.write_data(task_attempt_id, bytes)?;
        Ok(())
    }

    /// Mark a map attempt's upload finished and hand the drained pending
    /// flushes to the background scheduler. Flush failures never reach the
    /// caller; they corrupt the stage instead.
    pub fn finish_upload(self: &Arc<Self>, attempt: &AppTaskAttemptId) -> Result<()> {
        match self.finish_upload_impl(attempt) {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(stage) = self.lookup_stage(attempt.app_shuffle_id()) {
                    stage.set_file_corrupted();
                    self.persist_stage_corruption(attempt.app_shuffle_id());
                }
                warn!(
                    stage = %attempt.app_shuffle_id(),
                    error = %err,
                    "set file corrupted during finish upload"
                );
                Err(err)
            }
        }
    }

    fn finish_upload_impl(self: &Arc<Self>, attempt: &AppTaskAttemptId) -> Result<()> {
        self.update_liveness(attempt.app_id());

        // TODO close files once only stale attempts remain for the stage
        let stage = self.stage_state(attempt.app_shuffle_id())?;
        let drained = {
            let mut inner = stage.lock();
            inner.mark_finish_upload(attempt.clone());
            inner.add_pending_flush(attempt.clone());
            inner.fetch_flush_map_attempts()
        };
        if drained.is_empty() {
            return Ok(());
        }

        if !self.spawn_flush_task(Arc::clone(&stage), drained.clone()) {
            // scheduler is gone; leave the attempts for the shutdown drain
            let mut inner = stage.lock();
            for attempt in drained {
                inner.add_pending_flush(attempt);
            }
        }
        Ok(())
    }

    fn spawn_flush_task(
        self: &Arc<Self>,
        stage: Arc<ShuffleStageState>,
        attempts: Vec<AppTaskAttemptId>,
    ) -> bool {
        let guard = self.runtime.lock();
        let Some(runtime) = guard.as_ref() else {
            return false;
        };
        let executor = Arc::clone(self);
        let scheduled_at = Instant::now();
        runtime.spawn_blocking(move || {
            executor
                .metrics
                .set_map_attempt_flush_delay_ms(scheduled_at.elapsed().as_millis() as i64);
            let flush_start = Instant::now();
            if let Err(err) = executor.flush_partitions(&attempts) {
                warn!(
                    stage = %stage.app_shuffle_id(),
                    error = %err,
                    "failed to flush partitions"
                );
                stage.set_file_corrupted();
                executor.persist_stage_corruption(stage.app_shuffle_id());
            }
            executor
                .metrics
                .set_map_attempt_flush_time_ms(flush_start.elapsed().as_millis() as i64);
        });
        true
    }

    /// Flush-and-commit for one stage's drained attempts.
    ///
    /// All attempts must share one shuffle stage; anything else is a
    /// scheduling bug surfaced as `InvalidState`. Failures inside the
    /// flush/commit steps corrupt the stage and are not propagated.
    fn flush_partitions(&self, attempts: &[AppTaskAttemptId]) -> Result<()> {
        if attempts.is_empty() {
            return Ok(());
        }
        let distinct: HashSet<&AppShuffleId> =
            attempts.iter().map(|a| a.app_shuffle_id()).collect();
        if distinct.len() != 1 {
            return Err(SflError::InvalidState(format!(
                "flush must target exactly one shuffle stage, got {}",
                distinct.len()
            )));
        }

        let app_shuffle_id = attempts[0].app_shuffle_id().clone();
        let stage = self.stage_state(&app_shuffle_id)?;
        {
            let mut inner = stage.lock();
            if let Err(err) =
                self.flush_and_commit_locked(&mut inner, &app_shuffle_id, attempts)
            {
                warn!(
                    stage = %app_shuffle_id,
                    error = %err,
                    "failed to flush partitions"
                );
                inner.set_file_corrupted();
                self.persist_stage_corruption(&app_shuffle_id);
            }
        }

        self.maybe_commit_state_store();
        Ok(())
    }

    fn flush_and_commit_locked(
        &self,
        inner: &mut StageStateInner,
        app_shuffle_id: &AppShuffleId,
        attempts: &[AppTaskAttemptId],
    ) -> Result<()> {
        inner.flush_all_partitions()?;
        for attempt in attempts {
            inner.commit_map_task(attempt.map_id(), attempt.task_attempt_id);
            info!(
                stage = %app_shuffle_id,
                attempt = %attempt.map_task_attempt_id(),
                "commit task"
            );
        }
        let map_task_attempts = attempts
            .iter()
            .map(|attempt| attempt.map_task_attempt_id())
            .collect();
        let partition_files = inner.persisted_bytes_snapshots();
        self.state_store.store(&StateItem::TaskAttemptCommit {
            app_shuffle_id: app_shuffle_id.clone(),
            map_task_attempts,
            partition_files,
        })?;
        if inner.all_latest_task_attempts_committed() {
            inner.close_writers()?;
        }
        Ok(())
    }

    fn maybe_commit_state_store(&self) {
        let now = now_millis();
        let last = self.state_last_commit_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= self.config.state_commit_interval_millis {
            self.state_last_commit_ms.store(now, Ordering::Relaxed);
            if let Err(err) = self.state_store.commit() {
                warn!(error = %err, "state store commit failed");
            }
        }
    }

    /// Snapshot of `(path, length)` pairs persisted for one partition.
    pub fn get_persisted_bytes(
        &self,
        app_shuffle_id: &AppShuffleId,
        partition: i32,
    ) -> Result<Vec<FilePathAndLength>> {
        self.update_liveness(&app_shuffle_id.app_id);
        Ok(self
            .stage_state(app_shuffle_id)?
            .persisted_bytes_snapshot(partition))
    }

    pub fn close_partition_files(&self, id: &AppShufflePartitionId) -> Result<()> {
        let stage = self.stage_state(&id.app_shuffle_id)?;
        stage.close_writer(id.partition_id)
    }

    /// Stage health plus the committed attempt per map. Unknown stages
    /// report the `NotStarted` sentinel rather than an error.
    pub fn get_shuffle_stage_status(&self, app_shuffle_id: &AppShuffleId) -> ShuffleStageStatus {
        match self.lookup_stage(app_shuffle_id) {
            Some(stage) => stage.status(),
            None => ShuffleStageStatus::not_started(),
        }
    }

    pub fn get_shuffle_write_config(&self, app_shuffle_id: &AppShuffleId) -> Result<ShuffleWriteConfig> {
        Ok(self.stage_state(app_shuffle_id)?.write_config().clone())
    }

    /// Refresh the liveness timestamp for an application, creating its state
    /// lazily.
    pub fn update_liveness(&self, app_id: &AppId) -> Arc<AppState> {
        let app_state = self.app_state(app_id);
        app_state.update_liveness_timestamp();
        self.metrics
            .set_live_applications(self.app_states.len() as i64);
        app_state
    }

    /// Read-only quota probe; fails without corrupting any stage.
    pub fn check_app_max_write_bytes(&self, app_id: &AppId) -> Result<()> {
        let current = self.app_state(app_id).num_write_bytes();
        if current > self.config.app_max_write_bytes {
            return Err(SflError::QuotaExceeded(format!(
                "application {} wrote {} bytes exceeding max allowed {}",
                app_id, current, self.config.app_max_write_bytes
            )));
        }
        Ok(())
    }

    fn check_quota(&self, attempt: &AppTaskAttemptId, current_write_bytes: u64) -> Result<()> {
        if current_write_bytes > self.config.app_max_write_bytes {
            self.metrics.inc_truncated_applications();
            if let Some(stage) = self.lookup_stage(attempt.app_shuffle_id()) {
                stage.set_file_corrupted();
                self.persist_stage_corruption(attempt.app_shuffle_id());
            }
            return Err(SflError::QuotaExceeded(format!(
                "application {} wrote {} bytes exceeding max allowed {}",
                attempt.app_id(),
                current_write_bytes,
                self.config.app_max_write_bytes
            )));
        }
        Ok(())
    }

    /// Stop the executor: shut the scheduler down (waiting up to a 3-minute
    /// grace when asked), drain and flush every stage, and close the state
    /// store.
    pub fn stop(&self, wait: bool) {
        info!("stopping shuffle executor");

        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            if wait {
                runtime.shutdown_timeout(SHUTDOWN_GRACE);
            } else {
                runtime.shutdown_background();
            }
        }

        self.flush_all_stages_during_shutdown();

        if let Err(err) = self.state_store.close() {
            warn!(error = %err, "failed to close state store");
        }
        info!("stopped shuffle executor");
    }

    fn flush_all_stages_during_shutdown(&self) {
        let stages: Vec<Arc<ShuffleStageState>> = self
            .stage_states
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for stage in stages {
            let app_shuffle_id = stage.app_shuffle_id().clone();
            let mut inner = stage.lock();
            let pending = inner.fetch_flush_map_attempts();
            info!(
                stage = %app_shuffle_id,
                attempts = pending.len(),
                "flushing partitions during shutdown"
            );
            let result = if pending.is_empty() {
                inner.close_writers()
            } else {
                self.flush_and_commit_locked(&mut inner, &app_shuffle_id, &pending)
                    .and_then(|()| inner.close_writers())
            };
            if let Err(err) = result {
                warn!(
                    stage = %app_shuffle_id,
                    error = %err,
                    "failed to flush partitions during shutdown"
                );
                inner.set_file_corrupted();
                self.persist_stage_corruption(&app_shuffle_id);
            }
        }
    }

    /// Remove applications idle past the retention window, close their
    /// writers, persist their deletion, and reclaim their directories.
    /// Driven by the background scheduler every 60 seconds.
    pub fn remove_expired_applications(&self) {
        let now = now_millis();
        let mut expired: Vec<AppId> = Vec::new();
        for entry in self.app_states.iter() {
            if entry.value().liveness_timestamp_ms()
                < now.saturating_sub(self.config.app_retention_millis)
            {
                info!(app = %entry.key(), "found expired application");
                expired.push(entry.key().clone());
            }
        }
        self.metrics.inc_expired_applications(expired.len() as u64);

        for app_id in &expired {
            self.app_states.remove(app_id);

            let stage_ids: Vec<AppShuffleId> = self
                .stage_states
                .iter()
                .filter(|entry| &entry.key().app_id == app_id)
                .map(|entry| entry.key().clone())
                .collect();
            let mut removed = Vec::new();
            for id in &stage_ids {
                if let Some((_, stage)) = self.stage_states.remove(id) {
                    removed.push(stage);
                }
            }
            for stage in removed {
                if let Err(err) = stage.close_writers() {
                    warn!(
                        stage = %stage.app_shuffle_id(),
                        error = %err,
                        "failed to close writers for expired application"
                    );
                }
            }
            if let Err(err) = self.state_store.store(&StateItem::AppDeletion {
                app_id: app_id.clone(),
            }) {
                warn!(app = %app_id, error = %err, "failed to record app deletion");
            }
            info!(
                app = %app_id,
                stages = stage_ids.len(),
                "removed expired application"
            );
        }

        self.metrics
            .set_live_applications(self.app_states.len() as i64);

        for app_id in &expired {
            let dir = storage::app_dir(&self.config.root_dir, app_id.as_str());
            info!(dir = %dir.display(), "deleting expired application directory");
            if let Err(err) = self.storage.delete_directory(&dir) {
                warn!(
                    dir = %dir.display(),
                    error = %err,
                    "failed to delete expired application directory"
                );
            }
        }
    }

    fn load_state_store(&self) {
        let start = Instant::now();
        let result = self.load_state_store_impl();
        let duration_ms = start.elapsed().as_millis() as i64;
        self.metrics.set_state_load_time_ms(duration_ms);
        match result {
            Ok(load_result) => {
                info!(duration_ms, result = %load_result, "finished loading state");
            }
            Err(err) => {
                self.metrics.inc_state_load_errors();
                warn!(duration_ms, error = %err, "failed to load state");
            }
        }
    }

    fn load_state_store_impl(&self) -> Result<StateStoreLoadResult> {
        let start = Instant::now();
        let budget = Duration::from_millis(MAX_STATE_LOAD_MILLIS);
        let mut partial_load = false;
        let mut total_items = 0u64;
        let mut app_ids: HashSet<AppId> = HashSet::new();
        let mut deleted_apps: HashSet<AppId> = HashSet::new();
        let mut stages: HashSet<AppShuffleId> = HashSet::new();
        let mut corrupted_stages: HashSet<AppShuffleId> = HashSet::new();

        for item in self.state_store.load_data()? {
            match item {
                Ok(item) => {
                    self.load_state_item(
                        item,
                        &mut app_ids,
                        &mut deleted_apps,
                        &mut stages,
                        &mut corrupted_stages,
                    )?;
                    total_items += 1;
                }
                Err(StateLoadError::Decode(reason)) => {
                    self.metrics.inc_state_load_warnings();
                    warn!(reason = %reason, "skipping unreadable state item");
                }
                Err(StateLoadError::Torn) => {
                    self.metrics.inc_state_partial_loads();
                    warn!("state log ends with a torn record");
                    partial_load = true;
                    break;
                }
            }
            if start.elapsed() >= budget {
                self.metrics.inc_state_partial_loads();
                warn!("state load exceeded its time budget");
                partial_load = true;
                break;
            }
        }

        for app_shuffle_id in &corrupted_stages {
            if let Some(stage) = self.lookup_stage(app_shuffle_id) {
                stage.set_file_corrupted();
                self.state_store.store(&StateItem::StageCorruption {
                    app_shuffle_id: app_shuffle_id.clone(),
                })?;
            }
        }

        let mut num_deleted_stages = 0;
        for app_id in &deleted_apps {
            let stage_ids: Vec<AppShuffleId> = self
                .stage_states
                .iter()
                .filter(|entry| &entry.key().app_id == app_id)
                .map(|entry| entry.key().clone())
                .collect();
            num_deleted_stages += stage_ids.len();
            for id in &stage_ids {
                self.stage_states.remove(id);
            }
            self.state_store.store(&StateItem::AppDeletion {
                app_id: app_id.clone(),
            })?;
        }

        self.state_store.commit()?;

        app_ids.retain(|app_id| !deleted_apps.contains(app_id));
        for app_id in &app_ids {
            self.app_states
                .insert(app_id.clone(), Arc::new(AppState::new(app_id.clone())));
        }

        Ok(StateStoreLoadResult {
            partial_load,
            total_items,
            num_apps: app_ids.len(),
            num_deleted_apps: deleted_apps.len(),
            num_stages: stages.len(),
            num_corrupted_stages: corrupted_stages.len(),
            num_deleted_stages,
        })
    }

    fn load_state_item(
        &self,
        item: StateItem,
        app_ids: &mut HashSet<AppId>,
        deleted_apps: &mut HashSet<AppId>,
        stages: &mut HashSet<AppShuffleId>,
        corrupted_stages: &mut HashSet<AppShuffleId>,
    ) -> Result<()> {
        match item {
            StateItem::StageInfo {
                app_shuffle_id,
                num_maps,
                num_partitions,
                file_start_index,
                write_config,
                file_status,
            } => {
                app_ids.insert(app_shuffle_id.app_id.clone());
                stages.insert(app_shuffle_id.clone());
                // bump past the prior run's files so this run writes fresh
                // file suffixes
                let new_start_index = file_start_index + write_config.num_splits as i32;

                let effective = match self.lookup_stage(&app_shuffle_id) {
                    None => {
                        let stage = Arc::new(ShuffleStageState::with_file_start_index(
                            app_shuffle_id.clone(),
                            write_config.clone(),
                            new_start_index,
                        ));
                        stage.set_num_maps_partitions(num_maps, num_partitions);
                        self.stage_states
                            .insert(app_shuffle_id.clone(), Arc::clone(&stage));
                        stage
                    }
                    Some(existing) => {
                        if existing.num_maps() != num_maps {
                            existing.set_file_corrupted();
                            self.metrics.inc_state_load_warnings();
                            warn!(
                                stage = %app_shuffle_id,
                                old = existing.num_maps(),
                                new = num_maps,
                                "different numMaps while loading state"
                            );
                            corrupted_stages.insert(app_shuffle_id.clone());
                        }
                        if existing.num_partitions() != num_partitions {
                            existing.set_file_corrupted();
                            self.metrics.inc_state_load_warnings();
                            warn!(
                                stage = %app_shuffle_id,
                                old = existing.num_partitions(),
                                new = num_partitions,
                                "different numPartitions while loading state"
                            );
                            corrupted_stages.insert(app_shuffle_id.clone());
                        }
                        if existing.write_config() != &write_config {
                            existing.set_file_corrupted();
                            self.metrics.inc_state_load_warnings();
                            warn!(
                                stage = %app_shuffle_id,
                                "different write config while loading state"
                            );
                            corrupted_stages.insert(app_shuffle_id.clone());
                        }
                        existing.bump_file_start_index(new_start_index);
                        existing
                    }
                };

                if file_status == StageFileStatus::Corrupted {
                    effective.set_file_corrupted();
                    info!(stage = %app_shuffle_id, "stage corrupted in loaded state");
                    corrupted_stages.insert(app_shuffle_id.clone());
                }
                if corrupted_stages.contains(&app_shuffle_id) {
                    effective.set_file_corrupted();
                }
                // re-persist so the next run reads the bumped index
                self.state_store.store(&Self::stage_info_item(&effective))?;
            }
            StateItem::TaskAttemptCommit {
                app_shuffle_id,
                map_task_attempts,
                partition_files,
            } => {
                app_ids.insert(app_shuffle_id.app_id.clone());
                stages.insert(app_shuffle_id.clone());
                match self.lookup_stage(&app_shuffle_id) {
                    None => {
                        self.metrics.inc_state_load_warnings();
                        warn!(
                            stage = %app_shuffle_id,
                            "task attempt commit without stage state"
                        );
                        corrupted_stages.insert(app_shuffle_id);
                    }
                    Some(stage) => {
                        for attempt in &map_task_attempts {
                            stage.commit_map_task(attempt.map_id, attempt.task_attempt_id);
                        }
                        stage.add_finalized_files(partition_files.clone());
                        if corrupted_stages.contains(&app_shuffle_id) {
                            stage.set_file_corrupted();
                        }
                        // re-persist so the record survives compaction of the
                        // generation it was loaded from
                        self.state_store.store(&StateItem::TaskAttemptCommit {
                            app_shuffle_id,
                            map_task_attempts,
                            partition_files,
                        })?;
                    }
                }
            }
            StateItem::StageCorruption { app_shuffle_id } => {
                corrupted_stages.insert(app_shuffle_id);
            }
            StateItem::AppDeletion { app_id } => {
                app_ids.insert(app_id.clone());
                deleted_apps.insert(app_id);
            }
        }
        Ok(())
    }

    fn stage_info_item(stage: &ShuffleStageState) -> StateItem {
        let info = stage.persistent_info();
        StateItem::StageInfo {
            app_shuffle_id: stage.app_shuffle_id().clone(),
            num_maps: info.num_maps,
            num_partitions: info.num_partitions,
            file_start_index: info.file_start_index,
            write_config: stage.write_config().clone(),
            file_status: info.file_status,
        }
    }

    fn persist_stage_corruption(&self, app_shuffle_id: &AppShuffleId) {
        if let Err(err) = self.state_store.store(&StateItem::StageCorruption {
            app_shuffle_id: app_shuffle_id.clone(),
        }) {
            warn!(
                stage = %app_shuffle_id,
                error = %err,
                "failed to record stage corruption"
            );
        }
    }

    fn app_state(&self, app_id: &AppId) -> Arc<AppState> {
        if let Some(existing) = self.app_states.get(app_id) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .app_states
            .entry(app_id.clone())
            .or_insert_with(|| Arc::new(AppState::new(app_id.clone())));
        Arc::clone(entry.value())
    }

    fn lookup_stage(&self, app_shuffle_id: &AppShuffleId) -> Option<Arc<ShuffleStageState>> {
        self.stage_states
            .get(app_shuffle_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn stage_state(&self, app_shuffle_id: &AppShuffleId) -> Result<Arc<ShuffleStageState>> {
        self.lookup_stage(app_shuffle_id).ok_or_else(|| {
            SflError::StageNotStarted(format!("no shuffle stage found: {app_shuffle_id}"))
        })
    }

    /// Test utility: poll until the attempt's upload is finished or
    /// committed.
    pub fn wait_map_attempt_finished_upload(
        &self,
        attempt: &AppTaskAttemptId,
        max_wait: Duration,
    ) -> Result<()> {
        self.poll_until(max_wait, "map attempt finished upload", || {
            let stage = self.stage_state(attempt.app_shuffle_id())?;
            Ok(stage.is_map_attempt_finished_upload(attempt)
                || stage.is_map_attempt_committed(attempt))
        })
    }

    /// Test utility: poll until the attempt's commit is recorded.
    pub fn wait_map_attempt_committed(
        &self,
        attempt: &AppTaskAttemptId,
        max_wait: Duration,
    ) -> Result<()> {
        self.poll_until(max_wait, "map attempt committed", || {
            Ok(self
                .stage_state(attempt.app_shuffle_id())?
                .is_map_attempt_committed(attempt))
        })
    }

    /// Test utility: poll until every partition writer of the stage is
    /// closed.
    pub fn wait_shuffle_files_closed(
        &self,
        app_shuffle_id: &AppShuffleId,
        max_wait: Duration,
    ) -> Result<()> {
        self.poll_until(max_wait, "shuffle files closed", || {
            Ok(self.stage_state(app_shuffle_id)?.num_opened_writers() == 0)
        })
    }

    fn poll_until(
        &self,
        max_wait: Duration,
        what: &str,
        mut condition: impl FnMut() -> Result<bool>,
    ) -> Result<()> {
        let deadline = Instant::now() + max_wait;
        loop {
            if condition()? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SflError::InvalidState(format!(
                    "timed out after {max_wait:?} waiting for {what}"
                )));
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }
}
