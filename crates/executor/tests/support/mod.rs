#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use sfl_common::{
    AppShuffleId, AppTaskAttemptId, ExecutorConfig, MetricsRegistry, ShuffleWriteConfig,
};
use sfl_executor::{
    LocalFileStateStore, LocalShuffleStorage, ShuffleExecutor, ShuffleWriteOp, StateItem,
    StateStore,
};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn temp_root(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    std::env::temp_dir().join(format!("{prefix}_{nanos}"))
}

pub fn test_config(root: &Path) -> ExecutorConfig {
    ExecutorConfig {
        root_dir: root.to_path_buf(),
        fsync_enabled: false,
        ..ExecutorConfig::default()
    }
}

pub fn start_executor(config: ExecutorConfig, metrics: MetricsRegistry) -> Arc<ShuffleExecutor> {
    let state_store = Arc::new(
        LocalFileStateStore::open(config.root_dir.join("_state")).expect("open state store"),
    );
    ShuffleExecutor::start_with(config, Arc::new(LocalShuffleStorage), state_store, metrics)
        .expect("start executor")
}

pub fn attempt(stage: &AppShuffleId, map_id: i32, task_attempt_id: i64) -> AppTaskAttemptId {
    AppTaskAttemptId::new(stage.clone(), map_id, task_attempt_id)
}

pub fn write_op(
    stage: &AppShuffleId,
    map_id: i32,
    task_attempt_id: i64,
    partition: i32,
    payload: &'static [u8],
) -> ShuffleWriteOp {
    ShuffleWriteOp {
        app_shuffle_id: stage.clone(),
        map_id,
        task_attempt_id,
        partition,
        bytes: Bytes::from_static(payload),
    }
}

pub fn default_write_config() -> ShuffleWriteConfig {
    ShuffleWriteConfig::default()
}

/// Replay every state item the executor left behind. Opens a fresh store
/// generation, so call it only after `stop`.
pub fn read_state_items(root: &Path) -> Vec<StateItem> {
    let store = LocalFileStateStore::open(root.join("_state")).expect("reopen state store");
    store
        .load_data()
        .expect("load state data")
        .filter_map(|item| item.ok())
        .collect()
}

pub fn count_stage_infos(items: &[StateItem]) -> usize {
    items
        .iter()
        .filter(|item| matches!(item, StateItem::StageInfo { .. }))
        .count()
}

pub fn count_task_attempt_commits(items: &[StateItem]) -> usize {
    items
        .iter()
        .filter(|item| matches!(item, StateItem::TaskAttemptCommit { .. }))
        .count()
}

pub fn count_stage_corruptions(items: &[StateItem]) -> usize {
    items
        .iter()
        .filter(|item| matches!(item, StateItem::StageCorruption { .. }))
        .count()
}
