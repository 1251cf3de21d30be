use crate::resolver::LookupError;
use serde::Serialize;
use std::path::PathBuf;

pub const MAX_CHARACTERS_PER_ACCOUNT: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum ProfileSyncError {
    #[error("{0}")]
    NotFound(String),
    #[error("User ID {account_id} already has the maximum of {limit} associated characters.")]
    CapacityExceeded { account_id: String, limit: usize },
    #[error("Character ID {character_id} is already associated with User ID {account_id}.")]
    AlreadyAssociated {
        character_id: String,
        account_id: String,
    },
    #[error("invalid {kind} id: {value:?} (expected digits only)")]
    InvalidId { kind: &'static str, value: String },
    #[error("name lookup failed for character {character_id} ({}): {source}", path.display())]
    LookupFailed {
        character_id: String,
        path: PathBuf,
        #[source]
        source: LookupError,
    },
    #[error("failed to read {}: {source}", path.display())]
    FatalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of a user-facing operation. Callers display `message` as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpResult {
    pub success: bool,
    pub message: String,
}

impl OpResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

pub fn validate_id(kind: &'static str, value: &str) -> Result<(), ProfileSyncError> {
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(());
    }
    Err(ProfileSyncError::InvalidId {
        kind,
        value: value.to_string(),
    })
}
