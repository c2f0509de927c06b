use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use sfl_common::{AppShuffleId, Result};

/// Directory holding everything one application wrote; removed wholesale on
/// expiry.
pub fn app_dir(root: &Path, app_id: &str) -> PathBuf {
    root.join(app_id)
}

/// Directory holding one shuffle stage's partition files.
pub fn stage_dir(root: &Path, app_shuffle_id: &AppShuffleId) -> PathBuf {
    app_dir(root, app_shuffle_id.app_id.as_str())
        .join(format!("shuffle-{}", app_shuffle_id.shuffle_id))
}

pub fn partition_file_name(partition: i32, file_index: i32, codec: Option<&str>) -> String {
    match codec {
        Some(codec) if !codec.is_empty() => format!("part-{partition}-{file_index}.data.{codec}"),
        _ => format!("part-{partition}-{file_index}.data"),
    }
}

/// Filesystem operations the executor and its partition writers need.
///
/// The on-disk file format is opaque at this layer; the facade only creates
/// append streams and reclaims whole directories.
pub trait ShuffleStorage: fmt::Debug + Send + Sync {
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    fn open_append(&self, path: &Path) -> Result<File>;

    fn delete_directory(&self, path: &Path) -> Result<()>;

    fn exists(&self, path: &Path) -> bool;
}

/// Local-disk storage backend.
#[derive(Debug, Default)]
pub struct LocalShuffleStorage;

impl ShuffleStorage for LocalShuffleStorage {
    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn open_append(&self, path: &Path) -> Result<File> {
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }

    fn delete_directory(&self, path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}
