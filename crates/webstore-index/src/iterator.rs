//! Index enumeration

use std::collections::HashSet;
use webstore_policy::{ContextId, StorageClass};

use crate::{EntryId, IndexEntry, IndexError, Result, StorageObjectIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IterOrder {
    #[default]
    Unordered,
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Default)]
pub struct IterFilter {
    pub class: Option<StorageClass>,
    pub origin: Option<String>,
    pub persistent_only: bool,
}

impl IterFilter {
    pub fn class(mut self, class: StorageClass) -> Self {
        self.class = Some(class);
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn persistent_only(mut self) -> Self {
        self.persistent_only = true;
        self
    }

    pub fn matches(&self, entry: &IndexEntry) -> bool {
        let identity = entry.identity();
        self.class.map_or(true, |class| class == identity.class)
            && self
                .origin
                .as_deref()
                .map_or(true, |origin| origin == identity.origin)
            && (!self.persistent_only || identity.persistent)
    }
}

/// Walks the entries of one context. The sorted orders take a snapshot of
/// the ids up front. Any structural change to the index after the iterator
/// was created makes the next step fail with `StaleIterator`; `resync`
/// picks up the new state without repeating entries already returned.
pub struct IndexIterator<'a> {
    index: &'a StorageObjectIndex,
    context: ContextId,
    order: IterOrder,
    filter: IterFilter,
    ids: Vec<EntryId>,
    position: usize,
    mod_count: u64,
    returned: HashSet<EntryId>,
    failed: bool,
}

impl<'a> IndexIterator<'a> {
    pub(crate) fn new(
        index: &'a StorageObjectIndex,
        context: ContextId,
        order: IterOrder,
        filter: IterFilter,
    ) -> Self {
        let mut iter = Self {
            index,
            context,
            order,
            filter,
            ids: Vec::new(),
            position: 0,
            mod_count: 0,
            returned: HashSet::new(),
            failed: false,
        };
        iter.snapshot();
        iter
    }

    fn snapshot(&mut self) {
        self.mod_count = self.index.mod_count();
        self.ids = self
            .index
            .matching_ids(self.context, &self.filter, self.order);
        self.position = 0;
        self.failed = false;
    }

    pub fn is_stale(&self) -> bool {
        self.index.mod_count() != self.mod_count
    }

    pub fn next_entry(&mut self) -> Result<Option<IndexEntry>> {
        while let Some(id) = self.ids.get(self.position).copied() {
            if self.is_stale() {
                return Err(IndexError::StaleIterator);
            }
            self.position += 1;
            if self.returned.contains(&id) {
                continue;
            }
            let entry = self.index.entry(id);
            if self.is_stale() {
                self.position -= 1;
                return Err(IndexError::StaleIterator);
            }
            if let Some(entry) = entry.filter(|e| self.filter.matches(e)) {
                self.returned.insert(id);
                return Ok(Some(entry));
            }
        }
        if self.is_stale() {
            return Err(IndexError::StaleIterator);
        }
        Ok(None)
    }

    /// Continues over the current index state, skipping entries already
    /// returned.
    pub fn resync(&mut self) {
        self.snapshot();
    }

    /// Starts over from the beginning.
    pub fn restart(&mut self) {
        self.returned.clear();
        self.snapshot();
    }
}

impl Iterator for IndexIterator<'_> {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DiskFiles, Identity, IndexConfig};
    use std::sync::Arc;
    use webstore_policy::QuotaPolicy;

    fn index_with(origins: &[&str]) -> (tempfile::TempDir, StorageObjectIndex) {
        let dir = tempfile::tempdir().unwrap();
        let index = StorageObjectIndex::new(
            IndexConfig::default(),
            Arc::new(QuotaPolicy::new()),
            Arc::new(DiskFiles),
        );
        index.add_context(0, dir.path()).unwrap();
        for origin in origins {
            index
                .lookup_or_create(Identity::new(0, StorageClass::LocalStorage, *origin, None))
                .unwrap();
        }
        (dir, index)
    }

    fn origins(iter: IndexIterator<'_>) -> Vec<String> {
        iter.map(|e| e.unwrap().origin().to_string()).collect()
    }

    #[test]
    fn test_ordered_iteration() {
        let (_dir, index) = index_with(&["https://b.com", "https://A.com", "https://c.com"]);
        let asc = origins(index.iter(0, IterOrder::Ascending, IterFilter::default()));
        assert_eq!(asc, vec!["https://A.com", "https://b.com", "https://c.com"]);
        let desc = origins(index.iter(0, IterOrder::Descending, IterFilter::default()));
        assert_eq!(desc, vec!["https://c.com", "https://b.com", "https://A.com"]);
    }

    #[test]
    fn test_filters() {
        let (_dir, index) = index_with(&["https://a.com", "https://b.com"]);
        index
            .lookup_or_create(
                Identity::new(0, StorageClass::LocalStorage, "https://c.com", None).memory_only(),
            )
            .unwrap();

        let filter = IterFilter::default().origin("https://b.com");
        assert_eq!(origins(index.iter(0, IterOrder::Unordered, filter)), vec!["https://b.com"]);

        let persistent = IterFilter::default().persistent_only();
        assert_eq!(index.iter(0, IterOrder::Ascending, persistent).count(), 2);

        let web = IterFilter::default().class(StorageClass::WebDatabase);
        assert_eq!(index.iter(0, IterOrder::Unordered, web).count(), 0);
        assert_eq!(index.iter(1, IterOrder::Unordered, IterFilter::default()).count(), 0);
    }

    #[test]
    fn test_stale_iterator_never_repeats() {
        let (_dir, index) = index_with(&["https://a.com", "https://b.com", "https://c.com"]);
        let mut iter = index.iter(0, IterOrder::Ascending, IterFilter::default());
        let first = iter.next_entry().unwrap().unwrap();
        assert_eq!(first.origin(), "https://a.com");

        index
            .lookup_or_create(Identity::new(0, StorageClass::LocalStorage, "https://0.com", None))
            .unwrap();
        assert!(matches!(iter.next_entry(), Err(IndexError::StaleIterator)));

        iter.resync();
        let mut rest = Vec::new();
        while let Some(entry) = iter.next_entry().unwrap() {
            rest.push(entry.origin().to_string());
        }
        assert_eq!(rest, vec!["https://0.com", "https://b.com", "https://c.com"]);
    }

    #[test]
    fn test_unaffected_iteration_completes() {
        let (_dir, index) = index_with(&["https://a.com", "https://b.com"]);
        let iter = index.iter(0, IterOrder::Unordered, IterFilter::default());
        // Taking another reference is not a structural change.
        index
            .lookup_or_create(Identity::new(0, StorageClass::LocalStorage, "https://a.com", None))
            .unwrap();
        let mut seen = origins(iter);
        seen.sort();
        assert_eq!(seen, vec!["https://a.com", "https://b.com"]);
    }
}
