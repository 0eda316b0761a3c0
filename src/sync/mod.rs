//! Sync engine status records.
//!
//! Every status query resolves to a single machine-readable record; callers
//! print one line of JSON per record. Records are ephemeral and recomputed
//! per query.

pub mod client;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
    Error,
    /// The local sync engine process is confirmed absent; re-enter dev mode.
    Unreachable,
    /// Terminal marker used by informational templates.
    End,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub status: SyncState,
    pub msg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tips: String,
    #[serde(default, rename = "outOfSync", skip_serializing_if = "String::is_empty")]
    pub out_of_sync: String,
}

impl SyncStatus {
    pub fn idle(msg: impl Into<String>) -> Self {
        Self {
            status: SyncState::Idle,
            msg: msg.into(),
            tips: String::new(),
            out_of_sync: String::new(),
        }
    }

    pub fn syncing(msg: impl Into<String>, out_of_sync: impl Into<String>) -> Self {
        Self {
            status: SyncState::Syncing,
            msg: msg.into(),
            tips: String::new(),
            out_of_sync: out_of_sync.into(),
        }
    }

    pub fn error(msg: impl Into<String>, tips: impl Into<String>) -> Self {
        Self {
            status: SyncState::Error,
            msg: msg.into(),
            tips: tips.into(),
            out_of_sync: String::new(),
        }
    }

    /// Printed when `sync-status` is invoked without an application.
    pub fn welcome() -> Self {
        Self {
            status: SyncState::End,
            msg: "devswap sync-status".to_string(),
            tips: "specify an application and service to trace its file sync".to_string(),
            out_of_sync: String::new(),
        }
    }

    pub fn app_not_found(app: &str) -> Self {
        Self {
            status: SyncState::End,
            msg: format!("application {} not found", app),
            tips: "run `devswap start` first".to_string(),
            out_of_sync: String::new(),
        }
    }

    pub fn not_in_dev_mode(service: &str) -> Self {
        Self {
            status: SyncState::End,
            msg: format!("service {} is not in dev mode", service),
            tips: "run `devswap start` to enter dev mode".to_string(),
            out_of_sync: String::new(),
        }
    }

    /// The confirmed-absent helper case: no retry is productive, the caller
    /// is expected to re-enter dev mode.
    pub fn engine_not_running() -> Self {
        Self {
            status: SyncState::Unreachable,
            msg: "sync engine process not found".to_string(),
            tips: "re-enter dev mode with `devswap start`".to_string(),
            out_of_sync: String::new(),
        }
    }

    /// Single-line JSON rendering, one record per line.
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"status\":\"error\"}".to_string())
    }
}
