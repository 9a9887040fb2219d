use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::HandlerConfig;
use crate::instance::BackendInstance;

/// Concurrent keyed map of active backend instances.
///
/// `dashmap` gives lock-free reads on the hot path (the common case of
/// looking up an already-`Ready` instance) while still serializing
/// insert/remove against concurrent cold-start races. Per-instance mutable
/// state lives behind each instance's own lock (see `BackendInstance`), never
/// behind this map's internal shard locks.
pub struct Registry {
    instances: DashMap<String, Arc<BackendInstance>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<BackendInstance>> {
        self.instances.get(key).map(|r| Arc::clone(r.value()))
    }

    /// Insert `instance` iff no instance is currently registered for its key.
    /// Returns the instance that ended up in the map — either the one passed
    /// in (on success) or the one that raced ahead of it (on loss).
    pub fn insert_if_absent(&self, instance: Arc<BackendInstance>) -> Arc<BackendInstance> {
        match self.instances.entry(instance.key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => Arc::clone(existing.get()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&instance));
                instance
            }
        }
    }

    /// Remove the entry for `key` only if it still points at `instance`
    /// (guards against removing a newer instance that replaced a dead one).
    pub fn remove_if_current(&self, key: &str, instance: &Arc<BackendInstance>) {
        self.instances.remove_if(key, |_, v| Arc::ptr_eq(v, instance));
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn all(&self) -> Vec<Arc<BackendInstance>> {
        self.instances.iter().map(|r| Arc::clone(r.value())).collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute the stable fingerprint that deduplicates backend instances: two
/// requests whose effective configs fingerprint identically share one
/// backend, and requests whose fingerprints differ always get distinct ones.
///
/// Deliberately excludes nothing request-specific beyond what already lives
/// in `HandlerConfig` — callers are responsible for folding discovery
/// overrides into the config before fingerprinting, so that differing
/// discovery output produces differing keys automatically.
pub fn fingerprint(config: &HandlerConfig) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    config.executable.hash(&mut hasher);
    config.working_dir.hash(&mut hasher);
    config.env.pass_all.hash(&mut hasher);

    let sorted_pass: BTreeMap<_, _> = config.env.pass_names.iter().map(|n| (n.clone(), ())).collect();
    sorted_pass.keys().for_each(|k| k.hash(&mut hasher));
    config.env.extra.hash(&mut hasher); // BTreeMap hashes in key order already

    config.upstream_spec.hash(&mut hasher);

    format!("{:016x}", hasher.finish())
}
