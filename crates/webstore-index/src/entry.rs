//! Index entries

use crate::{DataFileHandle, EntryId, Identity, QuotaStatus};

/// Registry record for one storage object.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub(crate) id: EntryId,
    pub(crate) identity: Identity,
    pub(crate) domain: Option<String>,
    pub(crate) data_file: Option<DataFileHandle>,
    pub(crate) version: Option<String>,
    pub(crate) cached_size: Option<u64>,
    pub(crate) quota_status: QuotaStatus,
    pub(crate) marked_for_deletion: bool,
    /// Drop from the arena once the next flush has written the index
    /// without it.
    pub(crate) purge: bool,
    pub(crate) ref_count: u32,
}

impl IndexEntry {
    pub(crate) fn new(id: EntryId, identity: Identity) -> Self {
        let domain = crate::origin_domain(&identity.origin);
        Self {
            id,
            identity,
            domain,
            data_file: None,
            version: None,
            cached_size: None,
            quota_status: QuotaStatus::Default,
            marked_for_deletion: false,
            purge: false,
            ref_count: 0,
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn origin(&self) -> &str {
        &self.identity.origin
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn is_persistent(&self) -> bool {
        self.identity.persistent
    }

    pub fn data_file(&self) -> Option<&DataFileHandle> {
        self.data_file.as_ref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn quota_status(&self) -> QuotaStatus {
        self.quota_status
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Whether the entry belongs in the index file.
    pub(crate) fn is_persisted(&self) -> bool {
        self.identity.persistent
            && !self.marked_for_deletion
            && self
                .data_file
                .as_ref()
                .is_some_and(|file| !file.is_bogus() && file.relative_path().is_some())
    }
}
