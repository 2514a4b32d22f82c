//! Webstore Core
//!
//! Quota-managed persistent storage for web content:
//! - storage objects backed by one SQL data file each
//! - transactions with ordered statement queues, stepped cooperatively
//! - quota enforcement with user prompts, busy backoff and timeouts
//! - replay of explicit transactions the engine aborted
//! - recovery from corrupted data files

mod config;
mod env;
mod error;
mod events;
mod executor;
mod link;
mod object;
mod quota;
mod scheduler;
mod statement;
mod transaction;

pub use config::{ClassDefaults, Config, PromptFallback};
pub use env::StorageEnv;
pub use error::StorageError;
pub use events::ObjectEvent;
pub use object::{DriveStep, StorageObject};
pub use quota::{
    LogLowResource, LowResourceHandler, LowResourceKind, PromptTarget, QuotaPrompt, QuotaReply,
    QuotaRequest, QuotaResponder,
};
pub use scheduler::{ManualScheduler, Scheduler, Task, TaskId, TokioScheduler};
pub use statement::{
    StatementCallback, StatementHandle, StatementOptions, StatementResult, StatementState,
};
pub use transaction::{Transaction, TransactionId, TransactionOptions};

// Re-export the layers below
pub use webstore_index::{
    EntryId, Identity, IndexEntry, IndexError, IterFilter, IterOrder, QuotaStatus,
    StorageObjectIndex,
};
pub use webstore_policy::{
    Attribute, AttributeValue, ContextId, ExceededHandling, PolicyError, PolicyScope, Quota,
    QuotaPolicy, StorageClass, DEFAULT_CONTEXT,
};
pub use webstore_sql::{Engine, MemoryEngine, ResultSet, SqlError, SqlValue, SqliteEngine};

pub type Result<T> = std::result::Result<T, StorageError>;

/// Initialize logging
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(true).init();
}
