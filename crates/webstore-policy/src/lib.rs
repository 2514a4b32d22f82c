//! Webstore Quota Policy
//!
//! Attributes resolve at the most specific configured node and fall back
//! towards the root:
//! - per-origin override (context, class, origin)
//! - per-class override (context, class)
//! - class default (engine configuration)
//! - root (unlimited)
//!
//! Session storage has a fixed, non-configurable quota.

mod attribute;
mod class;
mod error;
mod policy;

pub use attribute::{AccessPolicy, Attribute, AttributeValue, ExceededHandling, Quota};
pub use class::{ContextId, StorageClass, DEFAULT_CONTEXT};
pub use error::PolicyError;
pub use policy::{PolicyChange, PolicyOverride, PolicyScope, QuotaPolicy};

pub type Result<T> = std::result::Result<T, PolicyError>;
