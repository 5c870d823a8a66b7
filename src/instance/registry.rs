//! In-memory directory of known instances.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, MutexGuard};

use super::types::{Instance, InstanceStatus};
use crate::error::{AppError, Result};

/// One registered instance.
///
/// The instance state has its own lock, held only for short reads and writes.
/// State-changing operations additionally hold the transition guard for their
/// whole duration, so two of them never interleave on the same instance.
#[derive(Debug)]
pub struct InstanceEntry {
    id: String,
    state: RwLock<Instance>,
    transition: Mutex<()>,
    /// Bumped on every start; exit watchers compare against it.
    generation: AtomicU64,
    /// Set by delete while it holds the transition guard.
    removed: AtomicBool,
}

impl InstanceEntry {
    fn new(instance: Instance) -> Self {
        Self {
            id: instance.id.clone(),
            state: RwLock::new(instance),
            transition: Mutex::new(()),
            generation: AtomicU64::new(0),
            removed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> Instance {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn status(&self) -> InstanceStatus {
        self.state.read().unwrap_or_else(|e| e.into_inner()).status
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut Instance) -> R) -> R {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn set_status(&self, status: InstanceStatus) {
        self.update(|instance| instance.status = status);
    }

    /// Wait for the transition guard. Fails with NotFound once the
    /// instance has been deleted, even if the caller looked it up before.
    pub async fn lock_transition(&self) -> Result<MutexGuard<'_, ()>> {
        let guard = self.transition.lock().await;
        if self.is_removed() {
            return Err(AppError::instance_not_found(&self.id));
        }
        Ok(guard)
    }

    /// Call with the transition guard held.
    pub fn mark_removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn begin_run(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: RwLock<BTreeMap<String, Arc<InstanceEntry>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Result<Arc<InstanceEntry>> {
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        instances
            .get(id)
            .map(Arc::clone)
            .ok_or_else(|| AppError::instance_not_found(id))
    }

    pub fn get_all(&self) -> Vec<Arc<InstanceEntry>> {
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        instances.values().map(Arc::clone).collect()
    }

    pub fn snapshot(&self) -> Vec<Instance> {
        self.get_all().iter().map(|e| e.snapshot()).collect()
    }

    pub fn exists(&self, id: &str) -> bool {
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        instances.contains_key(id)
    }

    pub fn put(&self, instance: Instance) -> Result<Arc<InstanceEntry>> {
        let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
        if instances.contains_key(&instance.id) {
            return Err(AppError::already_exists("instance", &instance.id));
        }
        let entry = Arc::new(InstanceEntry::new(instance));
        instances.insert(entry.id.clone(), Arc::clone(&entry));
        drop(instances);
        Ok(entry)
    }

    pub fn delete(&self, id: &str) -> Option<Arc<InstanceEntry>> {
        let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
        instances.remove(id)
    }

    pub fn search(&self, predicate: impl Fn(&Instance) -> bool) -> Vec<Instance> {
        self.get_all()
            .iter()
            .map(|e| e.snapshot())
            .filter(|i| predicate(i))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Every listed tag and every listed feature must be present. Empty sets match all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceQuery {
    pub tags: BTreeSet<String>,
    pub features: BTreeSet<String>,
}

impl InstanceQuery {
    pub fn matches(&self, instance: &Instance) -> bool {
        self.tags.iter().all(|t| instance.has_tag(t))
            && self.features.iter().all(|f| instance.provides(f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::fixtures;

    fn instance(id: &str) -> Instance {
        Instance::new(id.to_string(), fixtures::redis())
    }

    #[test]
    fn put_rejects_duplicates() {
        let registry = InstanceRegistry::new();
        registry.put(instance("a")).unwrap();
        let err = registry.put(instance("a")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AlreadyExists);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn get_missing_is_not_found() {
        let registry = InstanceRegistry::new();
        let err = registry.get("missing").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
        assert!(!registry.exists("missing"));
        assert!(registry.delete("missing").is_none());
    }

    #[test]
    fn entries_share_state_with_registry() {
        let registry = InstanceRegistry::new();
        let entry = registry.put(instance("a")).unwrap();
        entry.set_status(InstanceStatus::Running);
        assert_eq!(registry.get("a").unwrap().status(), InstanceStatus::Running);
        assert_eq!(registry.snapshot()[0].status, InstanceStatus::Running);
    }

    #[test]
    fn search_by_query() {
        let registry = InstanceRegistry::new();
        let mut tagged = instance("a");
        tagged.settings.tags.insert("cache".to_string());
        registry.put(tagged).unwrap();
        registry
            .put(Instance::new("b".to_string(), fixtures::postgres()))
            .unwrap();

        let query = InstanceQuery {
            tags: BTreeSet::from(["cache".to_string()]),
            ..Default::default()
        };
        let found = registry.search(|i| query.matches(i));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a");

        let query = InstanceQuery {
            features: BTreeSet::from(["postgres".to_string()]),
            ..Default::default()
        };
        let found = registry.search(|i| query.matches(i));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "b");

        assert_eq!(registry.search(|i| InstanceQuery::default().matches(i)).len(), 2);
    }

    #[tokio::test]
    async fn run_generation_increases() {
        let entry = InstanceEntry::new(instance("a"));
        let _guard = entry.lock_transition().await.unwrap();
        assert_eq!(entry.generation(), 0);
        assert_eq!(entry.begin_run(), 1);
        assert_eq!(entry.begin_run(), 2);
        assert_eq!(entry.generation(), 2);
    }

    #[tokio::test]
    async fn removed_entry_refuses_transitions() {
        let registry = InstanceRegistry::new();
        let entry = registry.put(instance("a")).unwrap();

        {
            let _guard = entry.lock_transition().await.unwrap();
            entry.mark_removed();
        }
        registry.delete("a");

        let err = entry.lock_transition().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
        assert!(entry.is_removed());
    }
}
