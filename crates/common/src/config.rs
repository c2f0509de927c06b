use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Per-stage write layout negotiated by mappers at registration time.
///
/// Immutable for the lifetime of a shuffle stage; a later registration with a
/// different value marks the stage corrupted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShuffleWriteConfig {
    /// Number of append files each partition spreads its attempts over.
    /// Always at least 1.
    pub num_splits: u16,
}

impl ShuffleWriteConfig {
    /// Build a config with the given split count, clamped to at least 1.
    pub fn new(num_splits: u16) -> Self {
        Self {
            num_splits: num_splits.max(1),
        }
    }
}

impl Default for ShuffleWriteConfig {
    fn default() -> Self {
        Self { num_splits: 1 }
    }
}

/// Executor-level configuration shared by the write, flush, recovery, and
/// expiry paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Filesystem base path holding per-application shuffle directories and
    /// the state store.
    pub root_dir: PathBuf,
    /// Whether flush also fsyncs partition files. Durability at task-finish
    /// boundaries costs write latency.
    pub fsync_enabled: bool,
    /// How long an application stays in memory after its last activity.
    #[serde(default = "default_app_retention_millis")]
    pub app_retention_millis: u64,
    /// How long application files stay on disk; enforced by the external
    /// file-retention collector, carried here for operators.
    #[serde(default = "default_app_file_retention_millis")]
    pub app_file_retention_millis: u64,
    /// Cumulative write-byte budget per application.
    #[serde(default = "default_app_max_write_bytes")]
    pub app_max_write_bytes: u64,
    /// Minimum interval between state-store commits. `0` commits on every
    /// flush.
    #[serde(default)]
    pub state_commit_interval_millis: u64,
    /// Compression codec tag passed through to partition writers verbatim.
    #[serde(default)]
    pub file_compression_codec: Option<String>,
    /// Worker threads of the background scheduler hosting flush and expiry
    /// work.
    #[serde(default = "default_flush_threads")]
    pub flush_threads: usize,
}

fn default_app_retention_millis() -> u64 {
    6 * 60 * 60 * 1000
}

fn default_app_file_retention_millis() -> u64 {
    36 * 60 * 60 * 1000
}

fn default_app_max_write_bytes() -> u64 {
    3 * 1024 * 1024 * 1024 * 1024
}

fn default_flush_threads() -> usize {
    2
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./sfl_shuffle"),
            fsync_enabled: true,
            app_retention_millis: default_app_retention_millis(),
            app_file_retention_millis: default_app_file_retention_millis(),
            app_max_write_bytes: default_app_max_write_bytes(),
            state_commit_interval_millis: 0,
            file_compression_codec: None,
            flush_threads: default_flush_threads(),
        }
    }
}
