//! Error types for reconciliation and repair operations

use thiserror::Error;

/// Appliance API error code reported when a Target still has live sessions.
pub const BUSY_ERROR_CODE: i64 = 18990710;

/// Reconciliation and repair errors
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Conflict: {0} is busy (active sessions); retry after restarting the iSCSI service")]
    Conflict(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error(
        "Partial apply on {path}: {reason} (original preserved at {backup}); already replaced: {}",
        describe_swapped(.swapped)
    )]
    PartialApply {
        path: String,
        backup: String,
        reason: String,
        /// `(path, backup)` of files replaced before the failure
        swapped: Vec<(String, String)>,
    },

    #[error("{0}; the iSCSI service is stopped and must be started manually")]
    ServiceStopped(String),

    #[error("Remote command `{command}` exited with status {status}: {stderr}")]
    Command {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("Appliance API error code {code}: {raw}")]
    Api { code: i64, raw: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ReconcileError {
    /// Build the error for a failed management API call, mapping the busy
    /// code onto [`ReconcileError::Conflict`].
    pub fn from_api(object: &str, code: i64, raw: impl Into<String>) -> Self {
        if code == BUSY_ERROR_CODE {
            ReconcileError::Conflict(object.to_string())
        } else {
            ReconcileError::Api {
                code,
                raw: raw.into(),
            }
        }
    }

    /// True for per-object failures that must not stop the remaining objects.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ReconcileError::Conflict(_) | ReconcileError::Integrity(_) | ReconcileError::Api { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ReconcileError::Conflict(_))
    }
}

fn describe_swapped(swapped: &[(String, String)]) -> String {
    if swapped.is_empty() {
        return "none".to_string();
    }
    swapped
        .iter()
        .map(|(path, backup)| format!("{} (backup {})", path, backup))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for reconciliation operations
pub type Result<T> = std::result::Result<T, ReconcileError>;
