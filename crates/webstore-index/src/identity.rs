//! Storage object identities

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use webstore_policy::{ContextId, StorageClass};

/// Number of origin hash buckets per storage class.
pub const BUCKET_COUNT: usize = 32;

/// Uniquely identifies one storage object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub context: ContextId,
    pub class: StorageClass,
    pub origin: String,
    /// Database name; key/value classes have a single unnamed object.
    pub name: Option<String>,
    /// Memory-only objects never touch the disk.
    pub persistent: bool,
}

impl Identity {
    pub fn new(
        context: ContextId,
        class: StorageClass,
        origin: impl Into<String>,
        name: Option<String>,
    ) -> Self {
        Self {
            context,
            class,
            origin: origin.into(),
            name,
            persistent: class.can_persist(),
        }
    }

    pub fn memory_only(mut self) -> Self {
        self.persistent = false;
        self
    }

    /// Session storage is never persistent, whatever the caller asked for.
    pub(crate) fn normalized(mut self) -> Self {
        if !self.class.can_persist() {
            self.persistent = false;
        }
        self
    }

    pub fn bucket(&self) -> usize {
        hash_origin(&self.origin)
    }

    /// Ordering used by sorted iterators: context, class, then origin and
    /// name compared without case.
    pub fn sort_cmp(&self, other: &Identity) -> Ordering {
        self.context
            .cmp(&other.context)
            .then_with(|| self.class.cmp(&other.class))
            .then_with(|| cmp_ignore_case(&self.origin, &other.origin))
            .then_with(|| {
                cmp_ignore_case(
                    self.name.as_deref().unwrap_or(""),
                    other.name.as_deref().unwrap_or(""),
                )
            })
            .then_with(|| self.persistent.cmp(&other.persistent))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.origin)?;
        if let Some(name) = &self.name {
            write!(f, "/{name}")?;
        }
        if !self.persistent {
            f.write_str(" (memory)")?;
        }
        Ok(())
    }
}

fn cmp_ignore_case(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
}

/// Key of an entry in the index arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(u64);

impl EntryId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where an entry stands in the quota prompt exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaStatus {
    #[default]
    Default,
    WaitingForUser,
    UserReplied,
}

/// Bucket of an origin: XOR of its first 16 bytes.
pub fn hash_origin(origin: &str) -> usize {
    let hash = origin.bytes().take(16).fold(0u8, |acc, byte| acc ^ byte);
    usize::from(hash) & (BUCKET_COUNT - 1)
}

/// Host part of an origin, shown to the user when asking for more quota.
pub fn origin_domain(origin: &str) -> Option<String> {
    url::Url::parse(origin)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
}
