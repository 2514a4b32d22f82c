//! Engine context
//!
//! Owns everything storage objects share: configuration, the SQL engine,
//! the scheduler, the quota policy and the object index. Storage objects
//! are opened through it and registered per index entry, so opening the
//! same identity twice yields the same object.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use webstore_index::{
    DataFiles, EntryId, Identity, IndexEntry, IndexError, IterFilter, IterOrder,
    StorageObjectIndex,
};
use webstore_policy::{
    Attribute, AttributeValue, ContextId, PolicyScope, QuotaPolicy, StorageClass, DEFAULT_CONTEXT,
};
use webstore_sql::Engine;

use crate::config::Config;
use crate::events::ObjectEvent;
use crate::object::{DriveStep, ObjectShared, StorageObject};
use crate::quota::{LogLowResource, LowResourceHandler, QuotaPrompt};
use crate::scheduler::Scheduler;
use crate::statement::{CallbackSlot, Source, StatementOptions};
use crate::transaction::TransactionOptions;
use crate::{Result, StorageError};

/// Resyncs an enumeration tolerates before giving up on a busy index.
const MAX_RESYNCS: usize = 16;

/// Data file operations routed through the engine, which may keep its
/// files somewhere other than the file system.
struct EngineFiles(Arc<dyn Engine>);

impl DataFiles for EngineFiles {
    fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(self.0.data_file_size(path)?.is_some())
    }

    fn file_size(&self, path: &Path) -> io::Result<Option<u64>> {
        self.0.data_file_size(path)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.0.remove_data_file(path)
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        self.0.list_data_files(dir)
    }
}

pub(crate) struct EnvInner {
    pub(crate) config: Config,
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) policy: Arc<QuotaPolicy>,
    pub(crate) index: Arc<StorageObjectIndex>,
    prompt: RwLock<Option<Arc<dyn QuotaPrompt>>>,
    low_resource: RwLock<Arc<dyn LowResourceHandler>>,
    objects: Mutex<HashMap<EntryId, Weak<ObjectShared>>>,
    contexts: Mutex<BTreeSet<ContextId>>,
    next_id: AtomicU64,
}

impl EnvInner {
    /// Ids for transactions, statements and quota requests.
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn prompt(&self) -> Option<Arc<dyn QuotaPrompt>> {
        self.prompt.read().clone()
    }

    pub(crate) fn low_resource(&self) -> Arc<dyn LowResourceHandler> {
        Arc::clone(&self.low_resource.read())
    }

    /// Unregisters a closed object, unless the entry was reopened since.
    pub(crate) fn forget_object(&self, entry: EntryId, object: &Weak<ObjectShared>) {
        let mut objects = self.objects.lock();
        if objects
            .get(&entry)
            .is_some_and(|registered| Weak::ptr_eq(registered, object))
        {
            objects.remove(&entry);
        }
    }
}

/// Shared handle to the storage engine context.
#[derive(Clone)]
pub struct StorageEnv {
    inner: Arc<EnvInner>,
}

impl StorageEnv {
    /// Installs the configured class defaults, then registers and loads the
    /// default context rooted at the profile folder.
    pub fn new(config: Config, engine: Arc<dyn Engine>, scheduler: Arc<dyn Scheduler>) -> Result<Self> {
        let policy = Arc::new(QuotaPolicy::new());
        config.apply_policy(&policy)?;
        let files: Arc<dyn DataFiles> = Arc::new(EngineFiles(Arc::clone(&engine)));
        let index = Arc::new(StorageObjectIndex::new(
            config.index_config(),
            Arc::clone(&policy),
            files,
        ));

        let env = Self {
            inner: Arc::new(EnvInner {
                config,
                engine,
                scheduler,
                policy,
                index,
                prompt: RwLock::new(None),
                low_resource: RwLock::new(Arc::new(LogLowResource)),
                objects: Mutex::new(HashMap::new()),
                contexts: Mutex::new(BTreeSet::new()),
                next_id: AtomicU64::new(1),
            }),
        };
        let root = env.inner.config.profile_dir.clone();
        env.add_context(DEFAULT_CONTEXT, root)?;
        Ok(env)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn index(&self) -> &Arc<StorageObjectIndex> {
        &self.inner.index
    }

    pub fn policy(&self) -> &Arc<QuotaPolicy> {
        &self.inner.policy
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.inner.scheduler
    }

    pub fn set_prompt(&self, prompt: Option<Arc<dyn QuotaPrompt>>) {
        *self.inner.prompt.write() = prompt;
    }

    pub fn set_low_resource_handler(&self, handler: Arc<dyn LowResourceHandler>) {
        *self.inner.low_resource.write() = handler;
    }

    /// Registers a context rooted at `root` and loads its index file.
    /// Returns the number of entries read back.
    pub fn add_context(&self, context: ContextId, root: impl Into<PathBuf>) -> Result<usize> {
        let loaded = self.inner.index.add_context(context, root)?;
        self.inner.contexts.lock().insert(context);
        tracing::info!(context, loaded, "Storage context ready");
        Ok(loaded)
    }

    /// Opens the storage object for `identity`, creating its index entry on
    /// first use. Each successful open must be paired with a `release`.
    pub fn open(&self, identity: Identity) -> Result<StorageObject> {
        let entry = self.inner.index.lookup_or_create(identity)?;
        let existing = self.inner.objects.lock().get(&entry).and_then(Weak::upgrade);
        if let Some(shared) = existing.filter(|shared| !shared.is_closed()) {
            shared.add_user();
            return Ok(StorageObject { shared });
        }

        let identity = match self.inner.index.entry(entry) {
            Some(entry) => entry.identity().clone(),
            None => {
                return Err(StorageError::Internal(format!("entry {entry} vanished while opening")));
            }
        };
        let shared = Arc::new_cyclic(|weak| {
            ObjectShared::new(Arc::clone(&self.inner), entry, identity, weak.clone())
        });
        self.inner
            .objects
            .lock()
            .insert(entry, Arc::downgrade(&shared));
        shared.events.emit(ObjectEvent::Opened(entry));
        tracing::debug!(entry = %entry, identity = %shared.identity, "Storage object opened");
        Ok(StorageObject { shared })
    }

    /// Number of storage objects currently open.
    pub fn open_objects(&self) -> usize {
        self.inner
            .objects
            .lock()
            .values()
            .filter(|object| object.strong_count() > 0)
            .count()
    }

    /// Marks the object for deletion. Its file goes once nothing uses it.
    pub fn delete_object(&self, identity: &Identity) -> Result<bool> {
        Ok(self.inner.index.delete(identity)?)
    }

    pub fn delete_objects(
        &self,
        context: ContextId,
        class: Option<StorageClass>,
        origin: Option<&str>,
        only_persistent: bool,
    ) -> Result<usize> {
        let deleted = self
            .inner
            .index
            .delete_objects(context, class, origin, only_persistent)?;
        tracing::info!(context, deleted, "Deleted storage objects");
        Ok(deleted)
    }

    pub fn delete_orphan_files(&self, context: ContextId) -> Result<usize> {
        Ok(self.inner.index.delete_orphan_files(context)?)
    }

    /// Writes the context's index file if it changed.
    pub fn flush_index(&self, context: ContextId) -> Result<bool> {
        Ok(self.inner.index.flush(context)?)
    }

    pub fn set_policy(
        &self,
        attribute: Attribute,
        scope: &PolicyScope,
        value: AttributeValue,
    ) -> Result<()> {
        self.inner.policy.set_attribute(attribute, scope, value)?;
        Ok(())
    }

    pub fn policy_value(&self, attribute: Attribute, scope: &PolicyScope) -> AttributeValue {
        self.inner.policy.get_attribute(attribute, scope)
    }

    /// Measures an object's data file through the engine. Objects that were
    /// never created measure zero.
    pub fn eval_data_size(&self, identity: &Identity) -> Result<u64> {
        if self.inner.index.find(identity).is_none() {
            return Ok(0);
        }
        let object = self.open(identity.clone())?;
        let measured = self.probe(&object);
        let size = object.data_size();
        object.release();
        measured?;
        size
    }

    fn probe(&self, object: &StorageObject) -> Result<()> {
        let tx = object.transaction(TransactionOptions::default().synchronous())?;
        let outcome = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&outcome);
        tx.object.enqueue(
            tx.id,
            String::new(),
            Vec::new(),
            StatementOptions::default(),
            Source::Probe,
            CallbackSlot::Real(Box::new(move |result| {
                *slot.lock() = Some(result.map(|_| ()));
            })),
        )?;
        let step = tx.flush()?;
        tx.release();
        let outcome = outcome.lock().take();
        match outcome {
            Some(result) => result,
            None => Err(StorageError::Internal(format!("size probe stopped at {step:?}"))),
        }
    }

    /// Entries of a context, restarting past concurrent index changes
    /// without repeating entries.
    pub fn enumerate(
        &self,
        context: ContextId,
        order: IterOrder,
        filter: IterFilter,
    ) -> Result<Vec<IndexEntry>> {
        let mut iter = self.inner.index.iter(context, order, filter);
        let mut entries = Vec::new();
        let mut resyncs = 0;
        loop {
            match iter.next_entry() {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => return Ok(entries),
                Err(IndexError::StaleIterator) if resyncs < MAX_RESYNCS => {
                    resyncs += 1;
                    iter.resync();
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Drives one object until it runs out of ready work. Returns the last
    /// step.
    pub fn run_object(&self, object: &StorageObject, max_rounds: usize) -> DriveStep {
        let mut step = DriveStep::Done;
        for _ in 0..max_rounds {
            step = object.drive();
            if step != DriveStep::Continue {
                break;
            }
        }
        step
    }

    /// Closes every open object and writes every dirty index file.
    pub fn shutdown(&self) -> Result<()> {
        let objects: Vec<Arc<ObjectShared>> = self
            .inner
            .objects
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for object in &objects {
            object.shutdown();
        }
        drop(objects);

        let contexts: Vec<ContextId> = self.inner.contexts.lock().iter().copied().collect();
        for context in contexts {
            if self.inner.index.flush(context)? {
                tracing::debug!(context, "Index written on shutdown");
            }
        }
        tracing::info!("Storage context shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualScheduler;
    use webstore_sql::MemoryEngine;

    fn env(dir: &Path) -> (StorageEnv, Arc<MemoryEngine>) {
        let engine = Arc::new(MemoryEngine::new());
        let env = StorageEnv::new(
            Config::new(dir),
            engine.clone(),
            Arc::new(ManualScheduler::new()),
        )
        .unwrap();
        (env, engine)
    }

    fn identity(origin: &str) -> Identity {
        Identity::new(
            DEFAULT_CONTEXT,
            StorageClass::WebDatabase,
            origin,
            Some("db".into()),
        )
    }

    #[test]
    fn test_open_shares_one_object_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (env, _) = env(dir.path());
        let a = env.open(identity("https://a.example")).unwrap();
        let b = env.open(identity("https://a.example")).unwrap();
        assert_eq!(a.entry_id(), b.entry_id());
        assert!(Arc::ptr_eq(&a.shared, &b.shared));
        assert_eq!(env.index().entry(a.entry_id()).unwrap().ref_count(), 2);

        b.release();
        assert!(!a.is_closed());
        let entry = a.entry_id();
        a.release();
        assert_eq!(env.open_objects(), 0);
        assert!(env.index().entry(entry).map_or(true, |e| e.ref_count() == 0));
    }

    #[test]
    fn test_eval_data_size() {
        let dir = tempfile::tempdir().unwrap();
        let (env, _) = env(dir.path());
        assert_eq!(env.eval_data_size(&identity("https://none.example")).unwrap(), 0);

        let object = env.open(identity("https://size.example")).unwrap();
        let tx = object
            .transaction(TransactionOptions::default().synchronous())
            .unwrap();
        tx.execute_sql("PUT k 42", Vec::new(), StatementOptions::default(), Box::new(|r| {
            r.unwrap();
        }))
        .unwrap();
        tx.flush().unwrap();
        tx.release();
        object.release();

        assert_eq!(env.eval_data_size(&identity("https://size.example")).unwrap(), 42);
    }

    #[test]
    fn test_reads_in_a_segment_are_not_saved_for_replay() {
        let dir = tempfile::tempdir().unwrap();
        let (env, _) = env(dir.path());
        let object = env.open(identity("https://reads.example")).unwrap();
        let tx = object.transaction(TransactionOptions::default()).unwrap();
        tx.begin(None).unwrap();
        for sql in ["PUT a 1", "SELECT", "COUNT"] {
            tx.execute_sql(sql, Vec::new(), StatementOptions::cached(), Box::new(|r| {
                r.unwrap();
            }))
            .unwrap();
        }
        while object.drive() != DriveStep::Done {}

        let inner = object.shared.inner.lock();
        let state = &inner.transactions[0];
        assert!(state.has_rollback_segment);
        let saved: Vec<&str> = state.saved.iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(saved, vec!["BEGIN", "PUT a 1"]);
    }

    #[test]
    fn test_enumerate_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let (env, _) = env(dir.path());
        let a = env.open(identity("https://a.example")).unwrap();
        let b = env.open(identity("https://b.example")).unwrap();
        let all = env
            .enumerate(DEFAULT_CONTEXT, IterOrder::Ascending, IterFilter::default())
            .unwrap();
        let origins: Vec<&str> = all.iter().map(|e| e.origin()).collect();
        assert_eq!(origins, vec!["https://a.example", "https://b.example"]);

        assert!(env.delete_object(&identity("https://a.example")).unwrap());
        assert!(!env.delete_object(&identity("https://zzz.example")).unwrap());
        assert!(env.index().entry(a.entry_id()).unwrap().is_marked_for_deletion());

        env.shutdown().unwrap();
        assert!(a.is_closed() && b.is_closed());
    }
}
