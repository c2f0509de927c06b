//! Server-side shuffle executor building blocks.
//!
//! Architecture role:
//! - per-application and per-stage state machines behind concurrent maps
//! - the write-then-flush-then-commit protocol over partition files
//! - append-only state log with startup replay and compaction
//! - retention expiry and storage reclamation
//!
//! Key modules:
//! - [`executor`]
//! - [`stage`]
//! - [`writer`]
//! - [`state`]
//! - [`storage`]
//! - [`app`]

pub mod app;
pub mod executor;
pub mod stage;
pub mod state;
pub mod storage;
pub mod writer;

pub use app::AppState;
pub use executor::{ShuffleExecutor, ShuffleWriteOp};
pub use stage::{ShuffleStageState, ShuffleStageStatus, StageFileStatus, StagePersistentInfo};
pub use state::{
    LocalFileStateStore, StateItem, StateLoadError, StateStore, StateStoreLoadResult,
};
pub use storage::{LocalShuffleStorage, ShuffleStorage};
pub use writer::{FilePathAndLength, PartitionFilePathAndLength, ShufflePartitionWriter};
