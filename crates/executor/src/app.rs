use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sfl_common::AppId;

/// Current wall clock in unix milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-application liveness and accounting, touched on every client call.
///
/// Created lazily on first activity; removed by retention expiry once the
/// liveness timestamp goes stale.
#[derive(Debug)]
pub struct AppState {
    app_id: AppId,
    liveness_timestamp_ms: AtomicU64,
    num_write_bytes: AtomicU64,
}

impl AppState {
    pub fn new(app_id: AppId) -> Self {
        Self {
            app_id,
            liveness_timestamp_ms: AtomicU64::new(now_millis()),
            num_write_bytes: AtomicU64::new(0),
        }
    }

    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    pub fn update_liveness_timestamp(&self) {
        self.liveness_timestamp_ms
            .store(now_millis(), Ordering::Relaxed);
    }

    pub fn liveness_timestamp_ms(&self) -> u64 {
        self.liveness_timestamp_ms.load(Ordering::Relaxed)
    }

    /// Add to the cumulative write counter and return the new total.
    pub fn add_num_write_bytes(&self, bytes: u64) -> u64 {
        self.num_write_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    pub fn num_write_bytes(&self) -> u64 {
        self.num_write_bytes.load(Ordering::Relaxed)
    }
}
