//! Webstore Storage Object Index
//!
//! Registry of storage object identities per context:
//! - one entry per (context, class, origin, name, persistence)
//! - sequential data file naming under `<subfolder>/<type>/<bucket>/<serial>`
//! - cached per-origin and per-class data sizes
//! - a JSON Lines index file per context, replaced atomically

mod data_file;
mod entry;
mod error;
mod identity;
mod index;
mod iterator;
pub mod persist;

pub use data_file::{DataFileHandle, DataFiles, DiskFiles};
pub use entry::IndexEntry;
pub use error::IndexError;
pub use identity::{hash_origin, origin_domain, EntryId, Identity, QuotaStatus, BUCKET_COUNT};
pub use index::{IndexConfig, StorageObjectIndex};
pub use iterator::{IndexIterator, IterFilter, IterOrder};
pub use persist::INDEX_FORMAT_VERSION;

pub type Result<T> = std::result::Result<T, IndexError>;
