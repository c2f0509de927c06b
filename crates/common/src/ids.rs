//! Typed identifiers shared across executor components.
//!
//! Every identifier is value-typed, totally ordered, and hashable so it can
//! key concurrent maps and ordered pending sets alike.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque application identifier assigned by the compute framework.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppId(
    /// Raw id string.
    pub String,
);

impl AppId {
    /// Borrow the raw id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AppId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AppId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One shuffle stage of one application.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppShuffleId {
    /// Owning application.
    pub app_id: AppId,
    /// Shuffle id within the application.
    pub shuffle_id: i32,
}

impl AppShuffleId {
    /// Build from an app id and shuffle id.
    pub fn new(app_id: impl Into<AppId>, shuffle_id: i32) -> Self {
        Self {
            app_id: app_id.into(),
            shuffle_id,
        }
    }
}

impl fmt::Display for AppShuffleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.app_id, self.shuffle_id)
    }
}

/// One map task of one shuffle stage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppMapId {
    /// Owning shuffle stage.
    pub app_shuffle_id: AppShuffleId,
    /// Map task id within the stage.
    pub map_id: i32,
}

impl fmt::Display for AppMapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.app_shuffle_id, self.map_id)
    }
}

/// One attempt of one map task. Retries increase `task_attempt_id`; only the
/// latest attempt per map id is effective.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppTaskAttemptId {
    /// Owning map task.
    pub app_map_id: AppMapId,
    /// Attempt number, unique per map task.
    pub task_attempt_id: i64,
}

impl AppTaskAttemptId {
    /// Build from stage id, map id, and attempt id.
    pub fn new(app_shuffle_id: AppShuffleId, map_id: i32, task_attempt_id: i64) -> Self {
        Self {
            app_map_id: AppMapId {
                app_shuffle_id,
                map_id,
            },
            task_attempt_id,
        }
    }

    /// Owning application.
    pub fn app_id(&self) -> &AppId {
        &self.app_map_id.app_shuffle_id.app_id
    }

    /// Owning shuffle stage.
    pub fn app_shuffle_id(&self) -> &AppShuffleId {
        &self.app_map_id.app_shuffle_id
    }

    /// Map task id within the stage.
    pub fn map_id(&self) -> i32 {
        self.app_map_id.map_id
    }

    /// The `(map_id, task_attempt_id)` pair without the stage prefix.
    pub fn map_task_attempt_id(&self) -> MapTaskAttemptId {
        MapTaskAttemptId {
            map_id: self.app_map_id.map_id,
            task_attempt_id: self.task_attempt_id,
        }
    }
}

impl fmt::Display for AppTaskAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.app_map_id, self.task_attempt_id)
    }
}

/// One reduce partition of one shuffle stage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppShufflePartitionId {
    /// Owning shuffle stage.
    pub app_shuffle_id: AppShuffleId,
    /// Reduce partition id within the stage.
    pub partition_id: i32,
}

impl fmt::Display for AppShufflePartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.app_shuffle_id, self.partition_id)
    }
}

/// A `(map_id, task_attempt_id)` pair, used where the stage is implied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MapTaskAttemptId {
    /// Map task id within the stage.
    pub map_id: i32,
    /// Attempt number, unique per map task.
    pub task_attempt_id: i64,
}

impl fmt::Display for MapTaskAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.map_id, self.task_attempt_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_ids_order_by_stage_then_map_then_attempt() {
        let stage = AppShuffleId::new("app-1", 3);
        let a = AppTaskAttemptId::new(stage.clone(), 0, 2);
        let b = AppTaskAttemptId::new(stage.clone(), 0, 5);
        let c = AppTaskAttemptId::new(stage, 1, 1);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.map_task_attempt_id(), MapTaskAttemptId {
            map_id: 0,
            task_attempt_id: 2
        });
    }

    #[test]
    fn display_is_dotted() {
        let id = AppTaskAttemptId::new(AppShuffleId::new("app-1", 3), 7, 9);
        assert_eq!(id.to_string(), "app-1.3.7.9");
    }
}
