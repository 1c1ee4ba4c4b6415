use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use kube::Resource;

use super::{is_stale, ObjectKey, StoreEvent, StoreWriter};
use crate::signaler::Signaler;

/// Applied change, reported to listeners such as [`super::DiffStore`].
pub(crate) enum Change<K> {
    Upserted(ObjectKey),
    Deleted(ObjectKey, Arc<K>),
}

/// Latest observed state of one resource kind.
#[derive(Debug)]
pub struct ResourceStore<K> {
    objects: Arc<RwLock<BTreeMap<ObjectKey, Arc<K>>>>,
    synced: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    signaler: Signaler,
}

impl<K> Clone for ResourceStore<K> {
    fn clone(&self) -> Self {
        ResourceStore {
            objects: self.objects.clone(),
            synced: self.synced.clone(),
            generation: self.generation.clone(),
            signaler: self.signaler.clone(),
        }
    }
}

impl<K> ResourceStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new(signaler: Signaler) -> Self {
        ResourceStore {
            objects: Arc::new(RwLock::new(BTreeMap::new())),
            synced: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            signaler,
        }
    }

    pub fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<K>> {
        self.get_by_key(&ObjectKey::new(namespace, name))
    }

    pub fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn entries(&self) -> BTreeMap<ObjectKey, Arc<K>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// Bumped on every applied change.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn apply_with(&self, event: StoreEvent<K>, mut on_change: impl FnMut(Change<K>)) {
        let mut changed = false;
        match event {
            StoreEvent::Upsert(obj) => {
                changed = self.upsert(obj, &mut on_change);
            }
            StoreEvent::Delete(obj) => {
                changed = self.delete(&ObjectKey::of(&obj), &mut on_change);
            }
            StoreEvent::Restarted(objs) => {
                let listed: BTreeSet<ObjectKey> = objs.iter().map(ObjectKey::of).collect();
                let stale: Vec<ObjectKey> = self
                    .objects
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .keys()
                    .filter(|k| !listed.contains(k))
                    .cloned()
                    .collect();
                for key in stale.iter() {
                    changed |= self.delete(key, &mut on_change);
                }
                for obj in objs.into_iter() {
                    changed |= self.upsert(obj, &mut on_change);
                }
                changed |= self.mark_synced();
            }
            StoreEvent::Sync => {
                changed = self.mark_synced();
            }
        }
        if changed {
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.signaler.event();
        }
    }

    fn mark_synced(&self) -> bool {
        !self.synced.swap(true, Ordering::SeqCst)
    }

    fn upsert(&self, obj: K, on_change: &mut impl FnMut(Change<K>)) -> bool {
        let key = ObjectKey::of(&obj);
        {
            let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(stored) = objects.get(&key) {
                if is_stale(stored.as_ref(), &obj) {
                    tracing::debug!(key = %key, "ignored stale object");
                    return false;
                }
            }
            objects.insert(key.clone(), Arc::new(obj));
        }
        on_change(Change::Upserted(key));
        true
    }

    fn delete(&self, key: &ObjectKey, on_change: &mut impl FnMut(Change<K>)) -> bool {
        let removed = self
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        match removed {
            Some(obj) => {
                on_change(Change::Deleted(key.clone(), obj));
                true
            }
            None => false,
        }
    }
}

impl<K> StoreWriter<K> for ResourceStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    fn apply(&self, event: StoreEvent<K>) {
        self.apply_with(event, |_| {})
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use k8s_openapi::api::core::v1::Secret;
    use kube::core::ObjectMeta;

    use super::*;

    fn secret(name: &str, rv: Option<&str>, value: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("kube-system".to_string()),
                resource_version: rv.map(|v| v.to_string()),
                ..Default::default()
            },
            string_data: Some(BTreeMap::from([("password".to_string(), value.to_string())])),
            ..Default::default()
        }
    }

    fn value(s: &Secret) -> String {
        s.string_data.as_ref().unwrap()["password"].clone()
    }

    #[tokio::test]
    async fn test_upsert_signals() {
        let signaler = Signaler::new();
        let mut events = signaler.events().unwrap();
        let store = ResourceStore::<Secret>::new(signaler);
        assert!(!store.synced());
        store.apply(StoreEvent::Upsert(secret("a", Some("1"), "x")));
        assert_eq!(Some(()), events.next().await);
        assert!(store.get(Some("kube-system"), "a").is_some());
        assert!(store.get(None, "a").is_none());
        store.apply(StoreEvent::Sync);
        assert!(store.synced());
    }

    #[test]
    fn test_last_writer_wins() {
        let store = ResourceStore::<Secret>::new(Signaler::new());
        store.apply(StoreEvent::Upsert(secret("a", Some("10"), "new")));
        store.apply(StoreEvent::Upsert(secret("a", Some("9"), "old")));
        let got = store.get(Some("kube-system"), "a").unwrap();
        assert_eq!("new", value(&got));
        store.apply(StoreEvent::Upsert(secret("a", Some("11"), "newer")));
        let got = store.get(Some("kube-system"), "a").unwrap();
        assert_eq!("newer", value(&got));
    }

    #[tokio::test]
    async fn test_restarted_replaces_contents() {
        let signaler = Signaler::new();
        let mut events = signaler.events().unwrap();
        let store = ResourceStore::<Secret>::new(signaler);
        store.apply(StoreEvent::Upsert(secret("a", None, "x")));
        store.apply(StoreEvent::Upsert(secret("b", None, "x")));
        events.next().await;
        let before = store.generation();

        store.apply(StoreEvent::Restarted(vec![secret("b", None, "y"), secret("c", None, "z")]));
        assert!(store.synced());
        assert!(store.generation() > before);
        let names: Vec<String> = store
            .list()
            .iter()
            .map(|s| s.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(vec!["b", "c"], names);
        assert_eq!(Some(()), events.next().await);

        // deleting an unknown key changes nothing and does not wake anyone
        store.apply(StoreEvent::Delete(secret("zz", None, "")));
        let next = tokio::time::timeout(Duration::from_millis(20), events.next()).await;
        assert!(next.is_err());
    }
}
