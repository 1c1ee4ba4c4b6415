use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

pub const DEFAULT_ERROR_TABLE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorKey {
    pub instance: String,
    pub kind: String,
    pub name: String,
}

impl ErrorKey {
    pub fn new(instance: &str, kind: &str, name: &str) -> Self {
        ErrorKey {
            instance: instance.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }
}

/// One row of the reconcile error table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileError {
    pub instance: String,
    pub resource_kind: String,
    pub resource_name: String,
    pub stage: String,
    pub error: String,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(skip)]
    seq: u64,
}

impl ReconcileError {
    pub fn key(&self) -> ErrorKey {
        ErrorKey::new(&self.instance, &self.resource_kind, &self.resource_name)
    }

    fn order(&self) -> (DateTime<Utc>, u64, ErrorKey) {
        (self.last_seen, self.seq, self.key())
    }
}

#[derive(Debug, Default)]
struct Inner {
    rows: HashMap<ErrorKey, ReconcileError>,
    // per instance, ordered by (last_seen, insertion sequence)
    by_instance: HashMap<String, BTreeSet<(DateTime<Utc>, u64, ErrorKey)>>,
    seq: u64,
}

impl Inner {
    fn unindex(&mut self, row: &ReconcileError) {
        if let Some(index) = self.by_instance.get_mut(&row.instance) {
            index.remove(&row.order());
            if index.is_empty() {
                self.by_instance.remove(&row.instance);
            }
        }
    }

    fn remove(&mut self, key: &ErrorKey) -> Option<ReconcileError> {
        let row = self.rows.remove(key)?;
        self.unindex(&row);
        Some(row)
    }

    fn insert(&mut self, row: ReconcileError) {
        self.by_instance
            .entry(row.instance.clone())
            .or_default()
            .insert(row.order());
        self.rows.insert(row.key(), row);
    }
}

/// Per (instance, resource) reconcile errors with bounded cardinality.
#[derive(Debug)]
pub struct ReconcileErrorTable {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl Default for ReconcileErrorTable {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_TABLE_CAPACITY)
    }
}

impl ReconcileErrorTable {
    pub fn new(capacity: usize) -> Self {
        ReconcileErrorTable {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn upsert(&self, key: ErrorKey, stage: &str, error: &str) {
        self.upsert_at(key, stage, error, Utc::now())
    }

    /// Record an error seen at `now`. Repeating the previous message bumps
    /// its count, a different message replaces the row.
    pub fn upsert_at(&self, key: ErrorKey, stage: &str, error: &str, now: DateTime<Utc>) {
        let mut inner = self.lock();
        inner.seq += 1;
        let seq = inner.seq;

        let row = match inner.remove(&key) {
            Some(mut prev) if prev.error == error => {
                prev.count += 1;
                prev.last_seen = now;
                prev.stage = stage.to_string();
                prev.seq = seq;
                prev
            }
            _ => ReconcileError {
                instance: key.instance.clone(),
                resource_kind: key.kind.clone(),
                resource_name: key.name.clone(),
                stage: stage.to_string(),
                error: error.to_string(),
                count: 1,
                first_seen: now,
                last_seen: now,
                seq,
            },
        };
        inner.insert(row);

        while inner
            .by_instance
            .get(&key.instance)
            .map(|idx| idx.len() > self.capacity)
            .unwrap_or(false)
        {
            let oldest = inner
                .by_instance
                .get(&key.instance)
                .and_then(|idx| idx.iter().next().cloned());
            match oldest {
                Some((_, _, evict)) => {
                    tracing::debug!(
                        instance = key.instance,
                        kind = evict.kind,
                        name = evict.name,
                        "evicted reconcile error"
                    );
                    inner.remove(&evict);
                }
                None => break,
            }
        }
    }

    pub fn get(&self, key: &ErrorKey) -> Option<ReconcileError> {
        self.lock().rows.get(key).cloned()
    }

    pub fn delete(&self, key: &ErrorKey) -> Option<ReconcileError> {
        self.lock().remove(key)
    }

    /// Drop every row of an instance.
    pub fn delete_instance(&self, instance: &str) -> usize {
        let mut inner = self.lock();
        let keys: Vec<ErrorKey> = match inner.by_instance.get(instance) {
            Some(idx) => idx.iter().map(|(_, _, k)| k.clone()).collect(),
            None => return 0,
        };
        for key in keys.iter() {
            inner.remove(key);
        }
        keys.len()
    }

    /// Keep only the rows of `instance` for which `keep` holds.
    pub fn retain_instance(&self, instance: &str, keep: impl Fn(&ReconcileError) -> bool) {
        let mut inner = self.lock();
        let drop: Vec<ErrorKey> = match inner.by_instance.get(instance) {
            Some(idx) => idx
                .iter()
                .filter_map(|(_, _, k)| inner.rows.get(k))
                .filter(|row| !keep(row))
                .map(|row| row.key())
                .collect(),
            None => return,
        };
        for key in drop.iter() {
            inner.remove(key);
        }
    }

    /// Rows of one instance in ascending `last_seen` order.
    pub fn list_instance(&self, instance: &str) -> Vec<ReconcileError> {
        let inner = self.lock();
        match inner.by_instance.get(instance) {
            Some(idx) => idx
                .iter()
                .filter_map(|(_, _, k)| inner.rows.get(k).cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    /// All rows ordered by instance, kind and name.
    pub fn list(&self) -> Vec<ReconcileError> {
        let inner = self.lock();
        let mut rows: Vec<ReconcileError> = inner.rows.values().cloned().collect();
        rows.sort_by_key(|r| r.key());
        rows
    }

    pub fn instances(&self) -> Vec<String> {
        let mut instances: Vec<String> = self.lock().by_instance.keys().cloned().collect();
        instances.sort();
        instances
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_by_kind(&self) -> BTreeMap<String, i64> {
        let mut counts = BTreeMap::new();
        for row in self.lock().rows.values() {
            *counts.entry(row.resource_kind.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use rstest::rstest;

    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_repeated_error_is_one_row() {
        let table = ReconcileErrorTable::default();
        let key = ErrorKey::new("asn-65001", "PeerConfig", "peer");
        for i in 0..5 {
            table.upsert_at(key.clone(), "neighbor", "secret not found", t(i));
        }
        assert_eq!(1, table.len());
        let row = table.get(&key).unwrap();
        assert_eq!(5, row.count);
        assert_eq!(t(0), row.first_seen);
        assert_eq!(t(4), row.last_seen);
    }

    #[test]
    fn test_changed_message_replaces_row() {
        let table = ReconcileErrorTable::default();
        let key = ErrorKey::new("i", "PeerConfig", "peer");
        table.upsert_at(key.clone(), "neighbor", "first", t(0));
        table.upsert_at(key.clone(), "neighbor", "first", t(1));
        table.upsert_at(key.clone(), "neighbor", "second", t(2));
        let row = table.get(&key).unwrap();
        assert_eq!("second", row.error);
        assert_eq!(1, row.count);
        assert_eq!(t(2), row.first_seen);
    }

    #[rstest(cap, inserted, case(4, 10), case(1024, 1030), case(3, 3))]
    fn test_capacity_evicts_oldest(cap: usize, inserted: i64) {
        let table = ReconcileErrorTable::new(cap);
        for i in 0..inserted {
            table.upsert_at(
                ErrorKey::new("i", "Service", &format!("svc-{i}")),
                "service",
                "boom",
                t(0) + Duration::seconds(i),
            );
        }
        table.upsert_at(ErrorKey::new("other", "Service", "x"), "service", "boom", t(0));
        let rows = table.list_instance("i");
        assert_eq!(cap.min(inserted as usize), rows.len());
        let first = inserted - rows.len() as i64;
        assert_eq!(format!("svc-{first}"), rows[0].resource_name);
        assert!(rows.windows(2).all(|w| w[0].last_seen <= w[1].last_seen));
        assert_eq!(1, table.list_instance("other").len());
    }

    #[test]
    fn test_refresh_protects_from_eviction() {
        let table = ReconcileErrorTable::new(2);
        let a = ErrorKey::new("i", "Service", "a");
        let b = ErrorKey::new("i", "Service", "b");
        table.upsert_at(a.clone(), "s", "boom", t(0));
        table.upsert_at(b.clone(), "s", "boom", t(1));
        table.upsert_at(a.clone(), "s", "boom", t(2));
        table.upsert_at(ErrorKey::new("i", "Service", "c"), "s", "boom", t(3));
        assert!(table.get(&a).is_some());
        assert!(table.get(&b).is_none());
    }

    #[test]
    fn test_retain_and_delete_instance() {
        let table = ReconcileErrorTable::default();
        table.upsert(ErrorKey::new("i", "Service", "a"), "service", "boom");
        table.upsert(ErrorKey::new("i", "Peer", "b"), "neighbor", "boom");
        table.upsert(ErrorKey::new("j", "Peer", "b"), "neighbor", "boom");
        table.retain_instance("i", |row| row.stage == "neighbor");
        assert_eq!(1, table.list_instance("i").len());
        assert_eq!(2, table.len());
        assert_eq!(1, table.delete_instance("i"));
        assert_eq!(vec!["j".to_string()], table.instances());
        assert_eq!(
            BTreeMap::from([("Peer".to_string(), 1)]),
            table.count_by_kind()
        );
    }
}
