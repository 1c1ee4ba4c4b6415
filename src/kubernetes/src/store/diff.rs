use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, PoisonError},
};

use kube::Resource;

use super::{
    resource::{Change, ResourceStore},
    ObjectKey, StoreEvent, StoreWriter,
};
use crate::signaler::Signaler;

#[derive(Debug)]
struct Pending<K> {
    upserted: BTreeSet<ObjectKey>,
    deleted: BTreeMap<ObjectKey, Arc<K>>,
}

impl<K> Default for Pending<K> {
    fn default() -> Self {
        Pending {
            upserted: BTreeSet::new(),
            deleted: BTreeMap::new(),
        }
    }
}

/// Objects changed since the last drain.
#[derive(Debug)]
pub struct Diff<K> {
    pub upserted: Vec<Arc<K>>,
    pub deleted: Vec<Arc<K>>,
}

impl<K> Default for Diff<K> {
    fn default() -> Self {
        Diff {
            upserted: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

impl<K> Clone for Diff<K> {
    fn clone(&self) -> Self {
        Diff {
            upserted: self.upserted.clone(),
            deleted: self.deleted.clone(),
        }
    }
}

impl<K> Diff<K> {
    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.deleted.is_empty()
    }
}

/// A [`ResourceStore`] that also tracks which keys changed since the last
/// call to [`DiffStore::diff`].
#[derive(Debug)]
pub struct DiffStore<K> {
    store: ResourceStore<K>,
    pending: Arc<Mutex<Pending<K>>>,
}

impl<K> Clone for DiffStore<K> {
    fn clone(&self) -> Self {
        DiffStore {
            store: self.store.clone(),
            pending: self.pending.clone(),
        }
    }
}

impl<K> DiffStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new(signaler: Signaler) -> Self {
        DiffStore {
            store: ResourceStore::new(signaler),
            pending: Arc::new(Mutex::new(Pending::default())),
        }
    }

    pub fn store(&self) -> &ResourceStore<K> {
        &self.store
    }

    pub fn synced(&self) -> bool {
        self.store.synced()
    }

    /// Drain the changes recorded since the previous call. A key shows up in
    /// at most one of the two lists.
    pub fn diff(&self) -> Diff<K> {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        let upserted = pending
            .upserted
            .iter()
            .filter_map(|key| self.store.get_by_key(key))
            .collect();
        Diff {
            upserted,
            deleted: pending.deleted.into_values().collect(),
        }
    }
}

impl<K> StoreWriter<K> for DiffStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    fn apply(&self, event: StoreEvent<K>) {
        let pending = self.pending.clone();
        self.store.apply_with(event, move |change| {
            let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
            match change {
                Change::Upserted(key) => {
                    pending.deleted.remove(&key);
                    pending.upserted.insert(key);
                }
                Change::Deleted(key, obj) => {
                    pending.upserted.remove(&key);
                    pending.deleted.insert(key, obj);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Service;
    use kube::core::ObjectMeta;

    use super::*;

    fn svc(name: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn names(objs: &[Arc<Service>]) -> Vec<String> {
        objs.iter()
            .map(|s| s.metadata.name.clone().unwrap())
            .collect()
    }

    #[test]
    fn test_diff_drains() {
        let store = DiffStore::<Service>::new(Signaler::new());
        store.apply(StoreEvent::Upsert(svc("a")));
        store.apply(StoreEvent::Upsert(svc("a")));
        store.apply(StoreEvent::Upsert(svc("b")));
        let diff = store.diff();
        assert_eq!(vec!["a", "b"], names(&diff.upserted));
        assert!(diff.deleted.is_empty());
        assert!(store.diff().is_empty());
    }

    #[test]
    fn test_delete_wins_over_upsert() {
        let store = DiffStore::<Service>::new(Signaler::new());
        store.apply(StoreEvent::Upsert(svc("a")));
        store.apply(StoreEvent::Delete(svc("a")));
        let diff = store.diff();
        assert!(diff.upserted.is_empty());
        assert_eq!(vec!["a"], names(&diff.deleted));
    }

    #[test]
    fn test_upsert_after_delete() {
        let store = DiffStore::<Service>::new(Signaler::new());
        store.apply(StoreEvent::Upsert(svc("a")));
        store.diff();
        store.apply(StoreEvent::Delete(svc("a")));
        store.apply(StoreEvent::Upsert(svc("a")));
        let diff = store.diff();
        assert_eq!(vec!["a"], names(&diff.upserted));
        assert!(diff.deleted.is_empty());
    }

    #[test]
    fn test_restarted_reports_missing_as_deleted() {
        let store = DiffStore::<Service>::new(Signaler::new());
        store.apply(StoreEvent::Upsert(svc("a")));
        store.apply(StoreEvent::Upsert(svc("b")));
        store.diff();
        store.apply(StoreEvent::Restarted(vec![svc("b")]));
        let diff = store.diff();
        assert_eq!(vec!["b"], names(&diff.upserted));
        assert_eq!(vec!["a"], names(&diff.deleted));
        assert!(store.synced());
    }
}
