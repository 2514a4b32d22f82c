//! Storage Object Index
//!
//! Registry of every storage object known to the engine. Entries live in an
//! arena keyed by `EntryId`; the per-context structure (class, origin hash
//! bucket, origin) only keeps ids. The backing file of an entry is a shared
//! `DataFileHandle`, so transactions holding it keep the file alive.

use crossbeam::channel::Receiver;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use webstore_policy::{
    AccessPolicy, ContextId, ExceededHandling, PolicyChange, PolicyScope, QuotaPolicy,
    StorageClass,
};

use crate::persist::{read_index_file, write_index_file, EntrySection, IndexRecord};
use crate::{
    hash_origin, DataFileHandle, DataFiles, EntryId, Identity, IndexEntry, IndexError,
    IndexIterator, IterFilter, IterOrder, QuotaStatus, Result, BUCKET_COUNT,
};

/// Companion files an engine keeps next to a data file.
const COMPANION_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Folder under the context root holding data files.
    pub subfolder: String,
    pub index_file: String,
    /// File system errors tolerated while probing for a free file name.
    pub bad_tries_limit: u32,
    /// Occupied names skipped while probing for a free file name.
    pub good_tries_limit: u32,
    /// Origins dropped when loading an index file.
    pub skipped_origins: Vec<String>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            subfolder: "pstorage".to_string(),
            index_file: "psindex.jsonl".to_string(),
            bad_tries_limit: 10,
            good_tries_limit: 10_000,
            skipped_origins: vec!["opera:blank".to_string()],
        }
    }
}

#[derive(Default)]
struct OriginInfo {
    entries: BTreeSet<EntryId>,
    cached_size: Option<u64>,
}

#[derive(Default)]
struct Bucket {
    origins: HashMap<String, OriginInfo>,
    next_serial: u32,
}

struct ClassIndex {
    buckets: Vec<Bucket>,
    cached_size: Option<u64>,
}

impl ClassIndex {
    fn new() -> Self {
        Self {
            buckets: (0..BUCKET_COUNT).map(|_| Bucket::default()).collect(),
            cached_size: None,
        }
    }

    fn origin(&self, origin: &str) -> Option<&OriginInfo> {
        self.buckets[hash_origin(origin)].origins.get(origin)
    }

    fn invalidate(&mut self, origin: Option<&str>) {
        self.cached_size = None;
        match origin {
            Some(origin) => {
                if let Some(info) = self.buckets[hash_origin(origin)].origins.get_mut(origin) {
                    info.cached_size = None;
                }
            }
            None => {
                for bucket in &mut self.buckets {
                    for info in bucket.origins.values_mut() {
                        info.cached_size = None;
                    }
                }
            }
        }
    }
}

struct ContextIndex {
    root: PathBuf,
    classes: Vec<ClassIndex>,
    generation: u64,
    flushed_generation: u64,
}

impl ContextIndex {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            classes: StorageClass::ALL.iter().map(|_| ClassIndex::new()).collect(),
            generation: 0,
            flushed_generation: 0,
        }
    }

    fn class(&self, class: StorageClass) -> &ClassIndex {
        &self.classes[class.index()]
    }

    fn class_mut(&mut self, class: StorageClass) -> &mut ClassIndex {
        &mut self.classes[class.index()]
    }

    fn mark_dirty(&mut self) {
        self.generation += 1;
    }

    fn is_dirty(&self) -> bool {
        self.generation != self.flushed_generation
    }
}

#[derive(Default)]
struct IndexState {
    contexts: HashMap<ContextId, ContextIndex>,
    entries: HashMap<EntryId, IndexEntry>,
    by_identity: HashMap<Identity, EntryId>,
    next_id: u64,
}

impl IndexState {
    fn entry_mut(&mut self, id: EntryId) -> Result<&mut IndexEntry> {
        self.entries.get_mut(&id).ok_or(IndexError::NotFound(id))
    }

    fn context_mut(&mut self, context: ContextId) -> Result<&mut ContextIndex> {
        self.contexts
            .get_mut(&context)
            .ok_or(IndexError::UnknownContext(context))
    }

    /// Drops cached aggregate sizes the entry contributes to.
    fn invalidate_for(&mut self, id: EntryId) {
        let Some(identity) = self.entries.get(&id).map(|e| e.identity.clone()) else {
            return;
        };
        if let Some(ctx) = self.contexts.get_mut(&identity.context) {
            ctx.class_mut(identity.class)
                .invalidate(Some(&identity.origin));
        }
    }

    fn mark_dirty(&mut self, context: ContextId) {
        if let Some(ctx) = self.contexts.get_mut(&context) {
            ctx.mark_dirty();
        }
    }

    /// Removes the backing file of an entry. The file itself goes once
    /// every transaction using it has let go.
    fn delete_data_file(&mut self, id: EntryId) -> Result<()> {
        let entry = self.entry_mut(id)?;
        if let Some(handle) = entry.data_file.take() {
            if !handle.is_memory() && !handle.is_bogus() {
                handle.set_will_be_deleted();
            }
        }
        entry.version = None;
        entry.cached_size = None;
        if entry.quota_status != QuotaStatus::WaitingForUser {
            entry.quota_status = QuotaStatus::Default;
        }
        let context = entry.identity.context;
        let persistent = entry.identity.persistent;
        self.invalidate_for(id);
        if persistent {
            self.mark_dirty(context);
        }
        Ok(())
    }

    fn remove_entry(&mut self, id: EntryId) -> Option<IndexEntry> {
        self.invalidate_for(id);
        let entry = self.entries.remove(&id)?;
        self.by_identity.remove(&entry.identity);
        if let Some(ctx) = self.contexts.get_mut(&entry.identity.context) {
            let bucket = &mut ctx.class_mut(entry.identity.class).buckets
                [entry.identity.bucket()];
            if let Some(info) = bucket.origins.get_mut(&entry.identity.origin) {
                info.entries.remove(&id);
                if info.entries.is_empty() {
                    bucket.origins.remove(&entry.identity.origin);
                }
            }
        }
        Some(entry)
    }
}

fn scope_of(identity: &Identity) -> PolicyScope {
    PolicyScope::origin(identity.context, identity.class, identity.origin.clone())
}

/// Size of an entry's data file, caching what was read from disk.
fn entry_size(entry: &mut IndexEntry) -> u64 {
    if let Some(size) = entry.cached_size {
        return size;
    }
    let Some(handle) = entry.data_file.as_ref() else {
        return 0;
    };
    match handle.file_size() {
        Ok(size) => {
            let size = size.unwrap_or(0);
            entry.cached_size = Some(size);
            size
        }
        Err(e) => {
            tracing::warn!(entry = %entry.id, error = %e, "Failed to read data file size");
            0
        }
    }
}

/// `(bucket, serial)` encoded in a relative data file path.
fn parse_serial(path: &Path) -> Option<(usize, u32)> {
    let serial = u32::from_str_radix(&path.file_name()?.to_string_lossy(), 16).ok()?;
    let bucket = usize::from_str_radix(&path.parent()?.file_name()?.to_string_lossy(), 16).ok()?;
    (bucket < BUCKET_COUNT).then_some((bucket, serial))
}

pub struct StorageObjectIndex {
    config: IndexConfig,
    policy: Arc<QuotaPolicy>,
    files: Arc<dyn DataFiles>,
    state: RwLock<IndexState>,
    mod_count: AtomicU64,
    policy_changes: Receiver<PolicyChange>,
}

impl StorageObjectIndex {
    pub fn new(config: IndexConfig, policy: Arc<QuotaPolicy>, files: Arc<dyn DataFiles>) -> Self {
        let policy_changes = policy.subscribe();
        Self {
            config,
            policy,
            files,
            state: RwLock::new(IndexState::default()),
            mod_count: AtomicU64::new(0),
            policy_changes,
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn policy(&self) -> &Arc<QuotaPolicy> {
        &self.policy
    }

    pub fn files(&self) -> &Arc<dyn DataFiles> {
        &self.files
    }

    /// Bumped by every structural change; iterators compare against it.
    pub fn mod_count(&self) -> u64 {
        self.mod_count.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.mod_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // === Contexts ===

    /// Registers a context and loads its index file. Returns the number of
    /// entries read back.
    pub fn add_context(&self, context: ContextId, root: impl Into<PathBuf>) -> Result<usize> {
        let root = root.into();
        let index_path = root.join(&self.config.index_file);
        let records = read_index_file(&index_path)?;

        let mut state = self.state.write();
        if state.contexts.contains_key(&context) {
            return Ok(0);
        }
        state.contexts.insert(context, ContextIndex::new(root.clone()));

        let mut loaded = 0;
        let mut policies = Vec::new();
        let mut needs_rewrite = false;
        for record in records {
            match record {
                IndexRecord::Header { .. } => {}
                IndexRecord::Policy(policy) => policies.push(policy),
                IndexRecord::Entry(section) => {
                    if self.config.skipped_origins.contains(&section.origin)
                        || !section.class.can_persist()
                        || section.origin.is_empty()
                    {
                        needs_rewrite = true;
                        continue;
                    }
                    let identity =
                        Identity::new(context, section.class, section.origin.clone(), section.name.clone());
                    if state.by_identity.contains_key(&identity) {
                        tracing::warn!(identity = %identity, "Duplicate index section ignored");
                        needs_rewrite = true;
                        continue;
                    }
                    let relative = section.data_file_path();
                    let id = self.insert_entry(&mut state, identity.clone())?;
                    if let Some((bucket, serial)) = parse_serial(&relative) {
                        let ctx = state.context_mut(context)?;
                        let bucket = &mut ctx.class_mut(identity.class).buckets[bucket];
                        bucket.next_serial = bucket.next_serial.max(serial.wrapping_add(1));
                    }
                    let entry = state.entry_mut(id)?;
                    entry.data_file = Some(DataFileHandle::on_disk(
                        &root,
                        relative,
                        Arc::clone(&self.files),
                    ));
                    entry.version = section.version;
                    loaded += 1;
                }
            }
        }
        if needs_rewrite {
            state.mark_dirty(context);
        }
        drop(state);

        self.policy.import(context, policies);
        tracing::info!(
            context,
            root = %root.display(),
            entries = loaded,
            "Loaded storage index"
        );
        Ok(loaded)
    }

    /// Forgets a context and every entry in it.
    pub fn remove_context(&self, context: ContextId) -> bool {
        let removed = {
            let mut state = self.state.write();
            if state.contexts.remove(&context).is_none() {
                return false;
            }
            let ids: Vec<EntryId> = state
                .entries
                .values()
                .filter(|e| e.identity.context == context)
                .map(|e| e.id)
                .collect();
            for id in &ids {
                if let Some(entry) = state.entries.remove(id) {
                    state.by_identity.remove(&entry.identity);
                }
            }
            ids.len()
        };
        self.policy.clear_context(context);
        self.bump();
        tracing::info!(context, entries = removed, "Removed storage context");
        true
    }

    pub fn has_context(&self, context: ContextId) -> bool {
        self.state.read().contexts.contains_key(&context)
    }

    pub fn context_root(&self, context: ContextId) -> Option<PathBuf> {
        self.state
            .read()
            .contexts
            .get(&context)
            .map(|ctx| ctx.root.clone())
    }

    pub fn index_file_path(&self, context: ContextId) -> Option<PathBuf> {
        self.context_root(context)
            .map(|root| root.join(&self.config.index_file))
    }

    // === Entries ===

    fn insert_entry(&self, state: &mut IndexState, identity: Identity) -> Result<EntryId> {
        state.next_id += 1;
        let id = EntryId::new(state.next_id);
        let ctx = state.context_mut(identity.context)?;
        ctx.class_mut(identity.class).buckets[identity.bucket()]
            .origins
            .entry(identity.origin.clone())
            .or_default()
            .entries
            .insert(id);
        ctx.class_mut(identity.class)
            .invalidate(Some(&identity.origin));
        state.by_identity.insert(identity.clone(), id);
        state.entries.insert(id, IndexEntry::new(id, identity));
        self.bump();
        Ok(id)
    }

    /// Finds the entry for `identity`, creating it on first use, and takes
    /// a reference on it.
    pub fn lookup_or_create(&self, identity: Identity) -> Result<EntryId> {
        let identity = identity.normalized();
        if identity.origin.is_empty() {
            return Err(IndexError::InvalidOrigin(identity.origin));
        }
        let scope = scope_of(&identity);
        if self.policy.access(&scope) == AccessPolicy::Deny {
            return Err(IndexError::NoAccess(format!(
                "storage disabled for {}",
                identity.origin
            )));
        }

        let mut state = self.state.write();
        if !state.contexts.contains_key(&identity.context) {
            return Err(IndexError::UnknownContext(identity.context));
        }

        if let Some(id) = state.by_identity.get(&identity).copied() {
            let entry = state.entry_mut(id)?;
            entry.ref_count += 1;
            if entry.marked_for_deletion {
                entry.marked_for_deletion = false;
                entry.purge = false;
                tracing::debug!(entry = %id, "Resurrected entry marked for deletion");
            }
            return Ok(id);
        }

        if let Some(max) = self.policy.max_objects_per_origin(&scope) {
            let live = state
                .contexts
                .get(&identity.context)
                .and_then(|ctx| ctx.class(identity.class).origin(&identity.origin))
                .map_or(0, |info| {
                    info.entries
                        .iter()
                        .filter(|id| {
                            state
                                .entries
                                .get(id)
                                .is_some_and(|e| !e.marked_for_deletion)
                        })
                        .count()
                });
            if live >= max as usize {
                return Err(IndexError::MaxObjectsPerOrigin {
                    origin: identity.origin,
                    max,
                });
            }
        }

        let id = self.insert_entry(&mut state, identity)?;
        let entry = state.entry_mut(id)?;
        entry.ref_count = 1;
        tracing::debug!(entry = %id, identity = %entry.identity, "Created index entry");
        Ok(id)
    }

    pub fn find(&self, identity: &Identity) -> Option<EntryId> {
        let identity = identity.clone().normalized();
        self.state.read().by_identity.get(&identity).copied()
    }

    /// Snapshot of an entry.
    pub fn entry(&self, id: EntryId) -> Option<IndexEntry> {
        self.state.read().entries.get(&id).cloned()
    }

    /// Drops a reference taken by `lookup_or_create`; returns what is left.
    pub fn release(&self, id: EntryId) -> Result<u32> {
        let mut state = self.state.write();
        let entry = state.entry_mut(id)?;
        entry.ref_count = entry.ref_count.saturating_sub(1);
        Ok(entry.ref_count)
    }

    /// Marks the object for deletion and removes its file. The entry stays
    /// until it is no longer referenced and, when persistent, until the
    /// index has been flushed without it.
    pub fn delete(&self, identity: &Identity) -> Result<bool> {
        let Some(id) = self.find(identity) else {
            return Ok(false);
        };
        self.delete_entry(id)?;
        Ok(true)
    }

    pub fn delete_entry(&self, id: EntryId) -> Result<()> {
        let mut state = self.state.write();
        Self::delete_entry_locked(&mut state, id)?;
        let removable = state
            .entries
            .get(&id)
            .is_some_and(|e| e.ref_count == 0 && !e.identity.persistent);
        if removable {
            state.remove_entry(id);
            self.bump();
        }
        Ok(())
    }

    fn delete_entry_locked(state: &mut IndexState, id: EntryId) -> Result<()> {
        state.delete_data_file(id)?;
        let entry = state.entry_mut(id)?;
        entry.marked_for_deletion = true;
        entry.purge = entry.identity.persistent;
        tracing::info!(entry = %id, identity = %entry.identity, "Storage object deleted");
        Ok(())
    }

    /// Removes the data file but keeps the entry usable; the next
    /// `ensure_data_file` allocates a fresh file.
    pub fn delete_data_file(&self, id: EntryId) -> Result<()> {
        self.state.write().delete_data_file(id)
    }

    /// Data file of an entry, allocating a file name on first use.
    pub fn ensure_data_file(&self, id: EntryId) -> Result<DataFileHandle> {
        let mut state = self.state.write();
        let entry = state.entry_mut(id)?;
        if let Some(handle) = entry.data_file.as_ref().filter(|h| !h.is_bogus()) {
            return Ok(handle.clone());
        }
        if !entry.identity.persistent {
            let handle = DataFileHandle::memory(Arc::clone(&self.files));
            entry.data_file = Some(handle.clone());
            return Ok(handle);
        }

        let identity = entry.identity.clone();
        let allocated = {
            let ctx = state.context_mut(identity.context)?;
            let root = ctx.root.clone();
            self.allocate_file_name(ctx, &identity)
                .map(|relative| (root, relative))
        };

        let entry = state.entry_mut(id)?;
        let Some((root, relative)) = allocated else {
            entry.data_file = Some(DataFileHandle::bogus(Arc::clone(&self.files)));
            tracing::warn!(entry = %id, "No free data file name");
            return Err(IndexError::NoAccess(format!(
                "no data file available for {identity}"
            )));
        };

        let handle = DataFileHandle::on_disk(&root, relative, Arc::clone(&self.files));
        if let Some(dir) = handle.absolute_path().and_then(Path::parent) {
            if let Err(e) = self.files.create_dir_all(dir) {
                entry.data_file = Some(DataFileHandle::bogus(Arc::clone(&self.files)));
                return Err(IndexError::NoAccess(format!(
                    "cannot create {}: {e}",
                    dir.display()
                )));
            }
        }
        entry.data_file = Some(handle.clone());
        entry.cached_size = None;
        state.mark_dirty(identity.context);
        tracing::debug!(
            entry = %id,
            path = ?handle.relative_path(),
            "Allocated data file"
        );
        Ok(handle)
    }

    /// Next free `<subfolder>/<type>/<bucket>/<serial>` name, probing past
    /// names already taken on disk.
    fn allocate_file_name(&self, ctx: &mut ContextIndex, identity: &Identity) -> Option<PathBuf> {
        let bucket_number = identity.bucket();
        let dir = PathBuf::from(&self.config.subfolder)
            .join(format!("{:02X}", identity.class.type_number()))
            .join(format!("{bucket_number:02X}"));
        let root = ctx.root.clone();
        let bucket = &mut ctx.class_mut(identity.class).buckets[bucket_number];

        let mut bad_tries = 0;
        let mut good_tries = 0;
        while bad_tries < self.config.bad_tries_limit && good_tries < self.config.good_tries_limit {
            let serial = bucket.next_serial;
            bucket.next_serial = bucket.next_serial.wrapping_add(1);
            let relative = dir.join(format!("{serial:08X}"));
            match self.files.exists(&root.join(&relative)) {
                Ok(false) => return Some(relative),
                Ok(true) => {}
                Err(e) => {
                    bad_tries += 1;
                    tracing::debug!(path = %relative.display(), error = %e, "Failed to probe data file");
                }
            }
            good_tries += 1;
        }
        None
    }

    pub fn set_version(&self, id: EntryId, version: Option<String>) -> Result<()> {
        let mut state = self.state.write();
        let entry = state.entry_mut(id)?;
        if entry.version == version {
            return Ok(());
        }
        entry.version = version;
        let context = entry.identity.context;
        if entry.identity.persistent {
            state.mark_dirty(context);
        }
        Ok(())
    }

    pub fn set_quota_status(&self, id: EntryId, status: QuotaStatus) -> Result<()> {
        self.state.write().entry_mut(id)?.quota_status = status;
        Ok(())
    }

    // === Sizes ===

    /// Records the current size of an entry's data file.
    pub fn set_data_file_size(&self, id: EntryId, size: u64) -> Result<()> {
        let mut state = self.state.write();
        let entry = state.entry_mut(id)?;
        if entry.cached_size == Some(size) {
            return Ok(());
        }
        entry.cached_size = Some(size);
        state.invalidate_for(id);
        Ok(())
    }

    pub fn data_file_size(&self, id: EntryId) -> Result<u64> {
        let mut state = self.state.write();
        Ok(entry_size(state.entry_mut(id)?))
    }

    pub fn invalidate_cached_sizes(
        &self,
        context: ContextId,
        class: StorageClass,
        origin: Option<&str>,
    ) {
        let mut state = self.state.write();
        if let Some(ctx) = state.contexts.get_mut(&context) {
            ctx.class_mut(class).invalidate(origin);
        }
    }

    fn apply_policy_changes(&self) {
        let changes: Vec<PolicyChange> = self.policy_changes.try_iter().collect();
        if changes.is_empty() {
            return;
        }
        let mut state = self.state.write();
        for change in changes {
            if let Some(ctx) = state.contexts.get_mut(&change.scope.context) {
                ctx.class_mut(change.scope.class)
                    .invalidate(change.scope.origin.as_deref());
                ctx.mark_dirty();
            }
        }
    }

    /// Bytes used by persistent objects of a class, for one origin or for
    /// the whole context. Origins whose quota handling is `allow` do not
    /// count against anyone.
    pub fn global_data_size(
        &self,
        context: ContextId,
        class: StorageClass,
        origin: Option<&str>,
    ) -> Result<u64> {
        self.apply_policy_changes();

        let mut state = self.state.write();
        let IndexState {
            contexts, entries, ..
        } = &mut *state;
        let ctx = contexts
            .get_mut(&context)
            .ok_or(IndexError::UnknownContext(context))?;
        let class_index = ctx.class_mut(class);

        let cached = match origin {
            Some(origin) => class_index.origin(origin).and_then(|info| info.cached_size),
            None => class_index.cached_size,
        };
        if let Some(size) = cached {
            return Ok(size);
        }

        let ids: Vec<EntryId> = match origin {
            Some(origin) => class_index
                .origin(origin)
                .map(|info| info.entries.iter().copied().collect())
                .unwrap_or_default(),
            None => class_index
                .buckets
                .iter()
                .flat_map(|bucket| bucket.origins.values())
                .flat_map(|info| info.entries.iter().copied())
                .collect(),
        };

        let mut handling: HashMap<String, ExceededHandling> = HashMap::new();
        let mut total = 0u64;
        for id in ids {
            let Some(entry) = entries.get_mut(&id) else {
                continue;
            };
            if !entry.identity.persistent || entry.marked_for_deletion {
                continue;
            }
            let origin_handling = *handling
                .entry(entry.identity.origin.clone())
                .or_insert_with(|| self.policy.exceeded_handling(&scope_of(&entry.identity)));
            if origin_handling == ExceededHandling::Allow {
                continue;
            }
            total = total.saturating_add(entry_size(entry));
        }

        match origin {
            Some(origin) => {
                if let Some(info) = class_index.buckets[hash_origin(origin)]
                    .origins
                    .get_mut(origin)
                {
                    info.cached_size = Some(total);
                }
            }
            None => class_index.cached_size = Some(total),
        }
        Ok(total)
    }

    // === Bulk operations ===

    /// Deletes every matching object. Returns how many were deleted.
    pub fn delete_objects(
        &self,
        context: ContextId,
        class: Option<StorageClass>,
        origin: Option<&str>,
        only_persistent: bool,
    ) -> Result<usize> {
        let mut state = self.state.write();
        let ids: Vec<EntryId> = state
            .entries
            .values()
            .filter(|e| {
                e.identity.context == context
                    && !e.marked_for_deletion
                    && class.map_or(true, |c| c == e.identity.class)
                    && origin.map_or(true, |o| o == e.identity.origin)
                    && (!only_persistent || e.identity.persistent)
            })
            .map(|e| e.id)
            .collect();

        let mut removed_any = false;
        for id in &ids {
            Self::delete_entry_locked(&mut state, *id)?;
            let removable = state
                .entries
                .get(id)
                .is_some_and(|e| e.ref_count == 0 && !e.identity.persistent);
            if removable {
                state.remove_entry(*id);
                removed_any = true;
            }
        }
        if removed_any {
            self.bump();
        }
        Ok(ids.len())
    }

    /// Removes files under the storage folder that no entry uses, then any
    /// folders left empty. Returns the number of files removed.
    pub fn delete_orphan_files(&self, context: ContextId) -> Result<usize> {
        let (storage_dir, referenced) = {
            let state = self.state.read();
            let ctx = state
                .contexts
                .get(&context)
                .ok_or(IndexError::UnknownContext(context))?;
            let referenced: HashSet<PathBuf> = state
                .entries
                .values()
                .filter(|e| e.identity.context == context)
                .filter_map(|e| e.data_file.as_ref()?.absolute_path().map(Path::to_path_buf))
                .collect();
            (ctx.root.join(&self.config.subfolder), referenced)
        };
        let mut removed = 0;
        for path in self.files.list(&storage_dir)? {
            if referenced.contains(&path) || is_companion_of_referenced(&path, &referenced) {
                continue;
            }
            // Removing a data file may have taken this companion with it.
            if !self.files.exists(&path)? {
                continue;
            }
            match self.files.remove(&path) {
                Ok(()) => {
                    removed += 1;
                    tracing::debug!(path = %path.display(), "Removed orphan file");
                }
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to remove orphan file"
                ),
            }
        }
        self.files.remove_empty_dirs(&storage_dir)?;
        tracing::info!(context, removed, "Removed orphan data files");
        Ok(removed)
    }

    /// Called when the last storage object for an entry goes away. Returns
    /// whether the entry left the index.
    pub fn object_shutdown(&self, id: EntryId, should_delete: bool) -> Result<bool> {
        let mut state = self.state.write();
        let entry = state.entry_mut(id)?;
        if entry.ref_count > 0 {
            return Ok(false);
        }
        if should_delete && !entry.marked_for_deletion {
            Self::delete_entry_locked(&mut state, id)?;
        }

        let entry = state.entry_mut(id)?;
        if entry.marked_for_deletion && entry.identity.persistent {
            entry.purge = true;
            return Ok(false);
        }
        if !entry.identity.persistent || entry.marked_for_deletion || entry.data_file.is_none() {
            state.remove_entry(id);
            self.bump();
            return Ok(true);
        }
        Ok(false)
    }

    // === Persistence ===

    pub fn is_dirty(&self, context: ContextId) -> bool {
        self.apply_policy_changes();
        self.state
            .read()
            .contexts
            .get(&context)
            .is_some_and(ContextIndex::is_dirty)
    }

    /// Writes the context's index file if anything changed since the last
    /// flush, then drops purged entries. Returns whether a file was written.
    pub fn flush(&self, context: ContextId) -> Result<bool> {
        self.apply_policy_changes();

        let (path, generation, sections, purged) = {
            let state = self.state.read();
            let ctx = state
                .contexts
                .get(&context)
                .ok_or(IndexError::UnknownContext(context))?;
            if !ctx.is_dirty() {
                return Ok(false);
            }
            let mut persisted: Vec<&IndexEntry> = state
                .entries
                .values()
                .filter(|e| e.identity.context == context && e.is_persisted())
                .collect();
            persisted.sort_by(|a, b| a.identity.sort_cmp(&b.identity));
            let sections: Vec<EntrySection> = persisted
                .into_iter()
                .filter_map(|e| {
                    let relative = e.data_file.as_ref()?.relative_path()?;
                    Some(EntrySection::new(
                        e.identity.class,
                        &e.identity.origin,
                        e.identity.name.as_deref(),
                        relative,
                        e.version.as_deref(),
                    ))
                })
                .collect();
            let purged: Vec<EntryId> = state
                .entries
                .values()
                .filter(|e| e.identity.context == context && e.purge)
                .map(|e| e.id)
                .collect();
            (
                ctx.root.join(&self.config.index_file),
                ctx.generation,
                sections,
                purged,
            )
        };

        let policies = self.policy.overrides(context);
        write_index_file(&path, &sections, &policies)?;

        let mut state = self.state.write();
        if let Some(ctx) = state.contexts.get_mut(&context) {
            ctx.flushed_generation = generation;
        }
        let mut removed = 0;
        for id in purged {
            let purgeable = state
                .entries
                .get(&id)
                .is_some_and(|e| e.purge && e.ref_count == 0);
            if purgeable {
                state.remove_entry(id);
                removed += 1;
            }
        }
        drop(state);
        if removed > 0 {
            self.bump();
        }

        tracing::info!(
            context,
            path = %path.display(),
            entries = sections.len(),
            purged = removed,
            "Storage index flushed"
        );
        Ok(true)
    }

    // === Enumeration ===

    pub fn iter(&self, context: ContextId, order: IterOrder, filter: IterFilter) -> IndexIterator<'_> {
        IndexIterator::new(self, context, order, filter)
    }

    /// Ids of matching entries, sorted when an order is requested.
    pub(crate) fn matching_ids(
        &self,
        context: ContextId,
        filter: &IterFilter,
        order: IterOrder,
    ) -> Vec<EntryId> {
        let state = self.state.read();
        let mut matching: Vec<&IndexEntry> = state
            .entries
            .values()
            .filter(|e| e.identity.context == context && filter.matches(e))
            .collect();
        match order {
            IterOrder::Unordered => {}
            IterOrder::Ascending => matching.sort_by(|a, b| a.identity.sort_cmp(&b.identity)),
            IterOrder::Descending => matching.sort_by(|a, b| b.identity.sort_cmp(&a.identity)),
        }
        matching.into_iter().map(|e| e.id).collect()
    }
}

fn is_companion_of_referenced(path: &Path, referenced: &HashSet<PathBuf>) -> bool {
    let name = path.to_string_lossy();
    COMPANION_SUFFIXES.iter().any(|suffix| {
        name.strip_suffix(suffix)
            .is_some_and(|base| referenced.contains(Path::new(base)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DiskFiles;
    use webstore_policy::{Attribute, AttributeValue, Quota};

    const ORIGIN: &str = "https://example.com";

    fn setup() -> (tempfile::TempDir, StorageObjectIndex) {
        let dir = tempfile::tempdir().unwrap();
        let index = StorageObjectIndex::new(
            IndexConfig::default(),
            Arc::new(QuotaPolicy::new()),
            Arc::new(DiskFiles),
        );
        index.add_context(0, dir.path()).unwrap();
        (dir, index)
    }

    fn db(name: &str) -> Identity {
        Identity::new(0, StorageClass::WebDatabase, ORIGIN, Some(name.to_string()))
    }

    #[test]
    fn test_lookup_or_create_is_unique() {
        let (_dir, index) = setup();
        let a = index.lookup_or_create(db("one")).unwrap();
        let b = index.lookup_or_create(db("one")).unwrap();
        assert_eq!(a, b);
        assert_eq!(index.entry(a).unwrap().ref_count(), 2);
        assert_eq!(index.len(), 1);
        assert_eq!(index.release(a).unwrap(), 1);
        assert_eq!(index.entry(a).unwrap().domain(), Some("example.com"));
    }

    #[test]
    fn test_invalid_and_denied_origins() {
        let (_dir, index) = setup();
        let empty = Identity::new(0, StorageClass::LocalStorage, "", None);
        assert!(matches!(
            index.lookup_or_create(empty),
            Err(IndexError::InvalidOrigin(_))
        ));

        index
            .policy()
            .set_attribute(
                Attribute::Access,
                &PolicyScope::origin(0, StorageClass::WebDatabase, ORIGIN),
                AttributeValue::Access(AccessPolicy::Deny),
            )
            .unwrap();
        assert!(matches!(
            index.lookup_or_create(db("x")),
            Err(IndexError::NoAccess(_))
        ));

        let unknown = Identity::new(9, StorageClass::LocalStorage, ORIGIN, None);
        assert!(matches!(
            index.lookup_or_create(unknown),
            Err(IndexError::UnknownContext(9))
        ));
    }

    #[test]
    fn test_max_objects_per_origin() {
        let (_dir, index) = setup();
        index
            .policy()
            .set_attribute(
                Attribute::MaxObjectsPerOrigin,
                &PolicyScope::class(0, StorageClass::WebDatabase),
                AttributeValue::Count(2),
            )
            .unwrap();
        index.lookup_or_create(db("a")).unwrap();
        let b = index.lookup_or_create(db("b")).unwrap();
        assert!(matches!(
            index.lookup_or_create(db("c")),
            Err(IndexError::MaxObjectsPerOrigin { max: 2, .. })
        ));
        index.delete_entry(b).unwrap();
        index.lookup_or_create(db("c")).unwrap();
    }

    #[test]
    fn test_file_names_are_sequential() {
        let (dir, index) = setup();
        let a = index.lookup_or_create(db("a")).unwrap();
        let b = index.lookup_or_create(db("b")).unwrap();

        let bucket = hash_origin(ORIGIN);
        std::fs::create_dir_all(dir.path().join(format!("pstorage/01/{bucket:02X}"))).unwrap();
        std::fs::write(
            dir.path().join(format!("pstorage/01/{bucket:02X}/00000001")),
            b"leftover",
        )
        .unwrap();

        let first = index.ensure_data_file(a).unwrap();
        let second = index.ensure_data_file(b).unwrap();
        assert_eq!(
            first.relative_path().unwrap(),
            Path::new(&format!("pstorage/01/{bucket:02X}/00000000"))
        );
        assert_eq!(
            second.relative_path().unwrap(),
            Path::new(&format!("pstorage/01/{bucket:02X}/00000002"))
        );
        assert!(index.ensure_data_file(a).unwrap().same_file(&first));
    }

    #[test]
    fn test_exhausted_probing_is_no_access() {
        let dir = tempfile::tempdir().unwrap();
        let config = IndexConfig {
            good_tries_limit: 2,
            ..IndexConfig::default()
        };
        let index =
            StorageObjectIndex::new(config, Arc::new(QuotaPolicy::new()), Arc::new(DiskFiles));
        index.add_context(0, dir.path()).unwrap();
        let bucket_dir = dir
            .path()
            .join(format!("pstorage/01/{:02X}", hash_origin(ORIGIN)));
        std::fs::create_dir_all(&bucket_dir).unwrap();
        std::fs::write(bucket_dir.join("00000000"), b"").unwrap();
        std::fs::write(bucket_dir.join("00000001"), b"").unwrap();

        let id = index.lookup_or_create(db("a")).unwrap();
        assert!(matches!(
            index.ensure_data_file(id),
            Err(IndexError::NoAccess(_))
        ));
        assert!(index.entry(id).unwrap().data_file().unwrap().is_bogus());
        // The next attempt probes past the occupied names.
        let handle = index.ensure_data_file(id).unwrap();
        assert!(handle.relative_path().unwrap().ends_with("00000002"));
    }

    #[test]
    fn test_global_size_cache() {
        let (_dir, index) = setup();
        let a = index.lookup_or_create(db("a")).unwrap();
        let b = index.lookup_or_create(db("b")).unwrap();
        let other = index
            .lookup_or_create(Identity::new(
                0,
                StorageClass::WebDatabase,
                "https://other.org",
                Some("a".into()),
            ))
            .unwrap();
        let memory = index.lookup_or_create(db("m").memory_only()).unwrap();
        index.set_data_file_size(a, 100).unwrap();
        index.set_data_file_size(b, 50).unwrap();
        index.set_data_file_size(other, 7).unwrap();
        index.set_data_file_size(memory, 1000).unwrap();

        let size = |origin: Option<&str>| index.global_data_size(0, StorageClass::WebDatabase, origin).unwrap();
        assert_eq!(size(Some(ORIGIN)), 150);
        assert_eq!(size(None), 157);

        index.set_data_file_size(b, 60).unwrap();
        assert_eq!(size(Some(ORIGIN)), 160);
        assert_eq!(size(None), 167);

        index
            .policy()
            .set_attribute(
                Attribute::ExceededHandling,
                &PolicyScope::origin(0, StorageClass::WebDatabase, ORIGIN),
                AttributeValue::Handling(ExceededHandling::Allow),
            )
            .unwrap();
        assert_eq!(size(Some(ORIGIN)), 0);
        assert_eq!(size(None), 7);
    }

    #[test]
    fn test_delete_removes_file_when_unused() {
        let (_dir, index) = setup();
        let id = index.lookup_or_create(db("a")).unwrap();
        let handle = index.ensure_data_file(id).unwrap();
        let path = handle.absolute_path().unwrap().to_path_buf();
        std::fs::write(&path, b"12345").unwrap();
        index.set_version(id, Some("1.0".into())).unwrap();

        assert!(index.delete(&db("a")).unwrap());
        // A transaction still holds the file.
        assert!(path.exists());
        drop(handle);
        assert!(!path.exists());

        let entry = index.entry(id).unwrap();
        assert!(entry.is_marked_for_deletion());
        assert_eq!(entry.version(), None);

        // Resurrected by a new lookup.
        index.lookup_or_create(db("a")).unwrap();
        assert!(!index.entry(id).unwrap().is_marked_for_deletion());
    }

    #[test]
    fn test_object_shutdown() {
        let (_dir, index) = setup();
        let memory = index.lookup_or_create(db("m").memory_only()).unwrap();
        index.release(memory).unwrap();
        assert!(index.object_shutdown(memory, false).unwrap());
        assert!(index.entry(memory).is_none());

        let kept = index.lookup_or_create(db("kept")).unwrap();
        index.ensure_data_file(kept).unwrap();
        index.release(kept).unwrap();
        assert!(!index.object_shutdown(kept, false).unwrap());
        assert!(index.entry(kept).is_some());

        assert!(!index.object_shutdown(kept, true).unwrap());
        assert!(index.flush(0).unwrap());
        assert!(index.entry(kept).is_none());
    }

    #[test]
    fn test_orphan_files() {
        let (dir, index) = setup();
        let id = index.lookup_or_create(db("a")).unwrap();
        let handle = index.ensure_data_file(id).unwrap();
        let path = handle.absolute_path().unwrap().to_path_buf();
        std::fs::write(&path, b"db").unwrap();
        std::fs::write(format!("{}-journal", path.display()), b"j").unwrap();

        let stray_dir = dir.path().join("pstorage/05/1F");
        std::fs::create_dir_all(&stray_dir).unwrap();
        std::fs::write(stray_dir.join("00000009"), b"stray").unwrap();

        assert_eq!(index.delete_orphan_files(0).unwrap(), 1);
        assert!(path.exists());
        assert!(!stray_dir.exists());
    }

    /// Files that only exist in a set, as an engine without a file system
    /// would keep them.
    #[derive(Default)]
    struct VirtualFiles(parking_lot::Mutex<BTreeSet<PathBuf>>);

    impl DataFiles for VirtualFiles {
        fn exists(&self, path: &Path) -> std::io::Result<bool> {
            Ok(self.0.lock().contains(path))
        }

        fn file_size(&self, path: &Path) -> std::io::Result<Option<u64>> {
            Ok(self.0.lock().contains(path).then_some(0))
        }

        fn remove(&self, path: &Path) -> std::io::Result<()> {
            self.0.lock().remove(path);
            Ok(())
        }

        fn list(&self, dir: &Path) -> std::io::Result<Vec<PathBuf>> {
            Ok(self
                .0
                .lock()
                .iter()
                .filter(|path| path.starts_with(dir))
                .cloned()
                .collect())
        }

        fn create_dir_all(&self, _path: &Path) -> std::io::Result<()> {
            Ok(())
        }

        fn remove_empty_dirs(&self, _dir: &Path) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_orphan_files_go_through_data_files() {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(VirtualFiles::default());
        let index = StorageObjectIndex::new(
            IndexConfig::default(),
            Arc::new(QuotaPolicy::new()),
            files.clone(),
        );
        index.add_context(0, dir.path()).unwrap();
        let id = index.lookup_or_create(db("a")).unwrap();
        let kept = index
            .ensure_data_file(id)
            .unwrap()
            .absolute_path()
            .unwrap()
            .to_path_buf();
        let stray = dir.path().join("pstorage/05/1F/00000009");
        files.0.lock().insert(kept.clone());
        files.0.lock().insert(stray);

        assert_eq!(index.delete_orphan_files(0).unwrap(), 1);
        assert_eq!(files.0.lock().iter().cloned().collect::<Vec<_>>(), vec![kept]);
    }

    #[test]
    fn test_policy_overrides_survive_reload() {
        let (dir, index) = setup();
        let scope = PolicyScope::origin(0, StorageClass::WebDatabase, ORIGIN);
        index
            .policy()
            .set_attribute(
                Attribute::OriginQuota,
                &scope,
                AttributeValue::Quota(Quota::Bytes(2048)),
            )
            .unwrap();
        assert!(index.is_dirty(0));
        assert!(index.flush(0).unwrap());
        assert!(!index.flush(0).unwrap());

        let reloaded = StorageObjectIndex::new(
            IndexConfig::default(),
            Arc::new(QuotaPolicy::new()),
            Arc::new(DiskFiles),
        );
        reloaded.add_context(0, dir.path()).unwrap();
        assert_eq!(reloaded.policy().origin_quota(&scope), Quota::Bytes(2048));
    }
}
