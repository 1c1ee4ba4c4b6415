pub mod diff;
pub mod resource;

use kube::{Resource, ResourceExt};

pub use diff::DiffStore;
pub use resource::ResourceStore;

/// Namespace and name of an object. Cluster scoped objects have no
/// namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        ObjectKey {
            namespace: namespace.map(|ns| ns.to_string()),
            name: name.to_string(),
        }
    }

    pub fn of<K: Resource>(obj: &K) -> Self {
        ObjectKey {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A change observed by a watcher.
#[derive(Debug, Clone)]
pub enum StoreEvent<K> {
    Upsert(K),
    Delete(K),
    /// Full relist. Objects missing from the list are deleted and the store
    /// is marked synced afterwards.
    Restarted(Vec<K>),
    Sync,
}

/// Sink for watcher events.
pub trait StoreWriter<K>: Send + Sync + 'static {
    fn apply(&self, event: StoreEvent<K>);
}

/// Numeric resourceVersion comparison. Versions that do not parse are
/// always considered newer.
pub(crate) fn is_stale<K: Resource>(stored: &K, incoming: &K) -> bool {
    let parse = |k: &K| {
        k.meta()
            .resource_version
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
    };
    match (parse(stored), parse(incoming)) {
        (Some(s), Some(i)) => i < s,
        _ => false,
    }
}
