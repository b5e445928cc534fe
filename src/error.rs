//! Error taxonomy for the inventory engine (see SPEC_FULL.md §7).

use thiserror::Error;

/// Kinds of failure the engine can surface. Workers never let these cross a
/// pool boundary as a panic or unhandled exception; every fallible call
/// returns one of these through a `Result`.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("credential error for account {account_id}: {message}")]
    Credential { account_id: String, message: String },

    #[error("account mismatch: configured {expected}, caller identity reported {actual}")]
    AccountMismatch { expected: String, actual: String },

    #[error("permission denied: {service} {operation} in {region}")]
    PermissionDenied {
        service: String,
        operation: String,
        region: String,
    },

    #[error("throttled after {attempts} attempts: {service} {operation}")]
    Throttled {
        service: String,
        operation: String,
        attempts: u32,
    },

    #[error("invalid policy document: {message}")]
    InvalidPolicy { message: String },

    #[error("corrupt snapshot {snapshot_id}: checksum mismatch")]
    CorruptSnapshot { snapshot_id: String },

    #[error("cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("unexpected error in {context}: {message}")]
    Unexpected { context: String, message: String },
}

impl InventoryError {
    pub fn unexpected(context: impl Into<String>, message: impl Into<String>) -> Self {
        InventoryError::Unexpected {
            context: context.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, InventoryError>;
