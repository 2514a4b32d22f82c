//! Hierarchical quota policy resolver

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::{
    AccessPolicy, Attribute, AttributeValue, ContextId, ExceededHandling, PolicyError, Quota,
    Result, StorageClass,
};

/// Default fixed per-origin quota for session storage.
const SESSION_STORAGE_QUOTA: u64 = 5 * 1024 * 1024;

/// Node an attribute is read from or written to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyScope {
    pub context: ContextId,
    pub class: StorageClass,
    pub origin: Option<String>,
}

impl PolicyScope {
    pub fn class(context: ContextId, class: StorageClass) -> Self {
        Self {
            context,
            class,
            origin: None,
        }
    }

    pub fn origin(context: ContextId, class: StorageClass, origin: impl Into<String>) -> Self {
        Self {
            context,
            class,
            origin: Some(origin.into()),
        }
    }

    /// The per-class scope above a per-origin one.
    pub fn parent(&self) -> Option<PolicyScope> {
        self.origin
            .as_ref()
            .map(|_| PolicyScope::class(self.context, self.class))
    }
}

/// Emitted on every effective `set_attribute`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyChange {
    pub scope: PolicyScope,
    pub attribute: Attribute,
}

/// One persisted override, as written to a context's index file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyOverride {
    pub class: StorageClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub attribute: Attribute,
    pub value: AttributeValue,
}

type Node = BTreeMap<Attribute, AttributeValue>;

#[derive(Default)]
struct PolicyState {
    class_defaults: HashMap<StorageClass, Node>,
    overrides: HashMap<PolicyScope, Node>,
}

impl PolicyState {
    fn resolve(&self, attribute: Attribute, scope: &PolicyScope) -> AttributeValue {
        let mut current = Some(scope.clone());
        while let Some(node_scope) = current {
            if let Some(value) = self
                .overrides
                .get(&node_scope)
                .and_then(|node| node.get(&attribute))
            {
                return *value;
            }
            current = node_scope.parent();
        }
        self.class_defaults
            .get(&scope.class)
            .and_then(|node| node.get(&attribute))
            .copied()
            .unwrap_or_else(|| attribute.root_default())
    }
}

pub struct QuotaPolicy {
    state: RwLock<PolicyState>,
    subscribers: Mutex<Vec<Sender<PolicyChange>>>,
}

impl QuotaPolicy {
    pub fn new() -> Self {
        let mut state = PolicyState::default();
        let session = state
            .class_defaults
            .entry(StorageClass::SessionStorage)
            .or_default();
        session.insert(
            Attribute::OriginQuota,
            AttributeValue::Quota(Quota::Bytes(SESSION_STORAGE_QUOTA)),
        );
        session.insert(
            Attribute::ExceededHandling,
            AttributeValue::Handling(ExceededHandling::Deny),
        );

        Self {
            state: RwLock::new(state),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Whether `set_attribute` can change `attribute` for `class`.
    pub fn is_configurable(&self, attribute: Attribute, class: StorageClass) -> bool {
        match class {
            StorageClass::SessionStorage => !matches!(
                attribute,
                Attribute::GlobalQuota | Attribute::OriginQuota | Attribute::ExceededHandling
            ),
            _ => true,
        }
    }

    /// Sets an engine-level default for every context of `class`. Used by
    /// configuration; not persisted and not subject to `is_configurable`.
    pub fn set_class_default(
        &self,
        class: StorageClass,
        attribute: Attribute,
        value: AttributeValue,
    ) -> Result<()> {
        if !attribute.accepts(&value) {
            return Err(PolicyError::TypeMismatch { attribute, value });
        }
        self.state
            .write()
            .class_defaults
            .entry(class)
            .or_default()
            .insert(attribute, value);
        Ok(())
    }

    pub fn get_attribute(&self, attribute: Attribute, scope: &PolicyScope) -> AttributeValue {
        self.state.read().resolve(attribute, scope)
    }

    /// Stores an override at `scope`. Subscribers are told about the change
    /// so cached sizes depending on it can be dropped.
    pub fn set_attribute(
        &self,
        attribute: Attribute,
        scope: &PolicyScope,
        value: AttributeValue,
    ) -> Result<()> {
        if !attribute.accepts(&value) {
            return Err(PolicyError::TypeMismatch { attribute, value });
        }
        if !self.is_configurable(attribute, scope.class) {
            return Err(PolicyError::NotConfigurable {
                attribute,
                class: scope.class,
            });
        }

        let previous = self
            .state
            .write()
            .overrides
            .entry(scope.clone())
            .or_default()
            .insert(attribute, value);
        if previous == Some(value) {
            return Ok(());
        }

        tracing::debug!(
            context = scope.context,
            class = %scope.class,
            origin = ?scope.origin,
            attribute = %attribute,
            value = ?value,
            "Policy attribute set"
        );
        self.notify(PolicyChange {
            scope: scope.clone(),
            attribute,
        });
        Ok(())
    }

    /// Drops an override so the attribute resolves from the parent again.
    pub fn clear_attribute(&self, attribute: Attribute, scope: &PolicyScope) -> bool {
        let removed = {
            let mut state = self.state.write();
            let removed = state
                .overrides
                .get_mut(scope)
                .and_then(|node| node.remove(&attribute))
                .is_some();
            if state.overrides.get(scope).is_some_and(BTreeMap::is_empty) {
                state.overrides.remove(scope);
            }
            removed
        };
        if removed {
            self.notify(PolicyChange {
                scope: scope.clone(),
                attribute,
            });
        }
        removed
    }

    /// Receives every change made through `set_attribute` or
    /// `clear_attribute` from now on.
    pub fn subscribe(&self) -> Receiver<PolicyChange> {
        let (tx, rx) = channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    fn notify(&self, change: PolicyChange) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(change.clone()).is_ok());
    }

    // === Typed accessors ===

    pub fn global_quota(&self, scope: &PolicyScope) -> Quota {
        self.get_attribute(Attribute::GlobalQuota, scope)
            .as_quota()
            .unwrap_or(Quota::Unlimited)
    }

    pub fn origin_quota(&self, scope: &PolicyScope) -> Quota {
        self.get_attribute(Attribute::OriginQuota, scope)
            .as_quota()
            .unwrap_or(Quota::Unlimited)
    }

    pub fn exceeded_handling(&self, scope: &PolicyScope) -> ExceededHandling {
        self.get_attribute(Attribute::ExceededHandling, scope)
            .as_handling()
            .unwrap_or(ExceededHandling::Deny)
    }

    /// `None` when the number of objects per origin is not limited.
    pub fn max_objects_per_origin(&self, scope: &PolicyScope) -> Option<u32> {
        self.get_attribute(Attribute::MaxObjectsPerOrigin, scope)
            .as_count()
            .filter(|max| *max > 0)
    }

    pub fn query_timeout(&self, scope: &PolicyScope) -> Option<Duration> {
        self.get_attribute(Attribute::QueryTimeout, scope)
            .as_timeout()
    }

    pub fn max_result_set_size(&self, scope: &PolicyScope) -> Quota {
        self.get_attribute(Attribute::MaxResultSetSize, scope)
            .as_quota()
            .unwrap_or(Quota::Unlimited)
    }

    pub fn access(&self, scope: &PolicyScope) -> AccessPolicy {
        self.get_attribute(Attribute::Access, scope)
            .as_access()
            .unwrap_or(AccessPolicy::Allow)
    }

    // === Persistence ===

    /// Overrides stored for `context`, in a stable order.
    pub fn overrides(&self, context: ContextId) -> Vec<PolicyOverride> {
        let state = self.state.read();
        let mut scopes: Vec<&PolicyScope> = state
            .overrides
            .keys()
            .filter(|scope| scope.context == context)
            .collect();
        scopes.sort();

        let mut out = Vec::new();
        for scope in scopes {
            if let Some(node) = state.overrides.get(scope) {
                for (attribute, value) in node {
                    out.push(PolicyOverride {
                        class: scope.class,
                        origin: scope.origin.clone(),
                        attribute: *attribute,
                        value: *value,
                    });
                }
            }
        }
        out
    }

    /// Restores overrides read back from an index file. Entries with the
    /// wrong shape or for fixed attributes are skipped.
    pub fn import(&self, context: ContextId, overrides: impl IntoIterator<Item = PolicyOverride>) {
        let mut state = self.state.write();
        for entry in overrides {
            if !entry.attribute.accepts(&entry.value)
                || !self.is_configurable(entry.attribute, entry.class)
            {
                tracing::warn!(
                    context,
                    class = %entry.class,
                    attribute = %entry.attribute,
                    "Skipping invalid policy override"
                );
                continue;
            }
            let scope = PolicyScope {
                context,
                class: entry.class,
                origin: entry.origin,
            };
            state
                .overrides
                .entry(scope)
                .or_default()
                .insert(entry.attribute, entry.value);
        }
    }

    /// Forgets every override of `context`.
    pub fn clear_context(&self, context: ContextId) {
        self.state
            .write()
            .overrides
            .retain(|scope, _| scope.context != context);
    }
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self::new()
    }
}
