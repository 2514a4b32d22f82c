//! Index error types

use thiserror::Error;
use webstore_policy::{ContextId, PolicyError};

use crate::EntryId;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Access to storage denied: {0}")]
    NoAccess(String),

    #[error("Invalid origin: {0:?}")]
    InvalidOrigin(String),

    #[error("Origin {origin} reached its limit of {max} storage objects")]
    MaxObjectsPerOrigin { origin: String, max: u32 },

    #[error("Index changed while iterating")]
    StaleIterator,

    #[error("Entry not found: {0}")]
    NotFound(EntryId),

    #[error("Unknown context: {0}")]
    UnknownContext(ContextId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),
}
