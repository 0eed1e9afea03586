//! In-process record store.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tracing::debug;

use super::{Batch, EntityKind, Expect, Record, RecordKey, RecordStore, StoreError, Versioned};

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<EntityKind, HashMap<String, Versioned<Record>>>,
    sequences: HashMap<EntityKind, u64>,
}

impl Tables {
    fn version_of(&self, key: &RecordKey) -> Option<u64> {
        self.records
            .get(&key.kind)
            .and_then(|table| table.get(&key.id))
            .map(|row| row.version)
    }
}

/// Record store backed by hash maps behind one lock.
///
/// Commits take the write lock once, so a batch is checked and applied
/// without any other commit interleaving.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records of `kind`.
    pub fn count(&self, kind: EntityKind) -> usize {
        self.tables
            .read()
            .records
            .get(&kind)
            .map_or(0, HashMap::len)
    }
}

impl RecordStore for MemoryStore {
    fn get(&self, key: &RecordKey) -> Result<Option<Versioned<Record>>, StoreError> {
        Ok(self
            .tables
            .read()
            .records
            .get(&key.kind)
            .and_then(|table| table.get(&key.id))
            .cloned())
    }

    fn commit(&self, batch: Batch) -> Result<(), StoreError> {
        let writes = batch.into_writes();
        let mut tables = self.tables.write();

        let mut seen = HashSet::with_capacity(writes.len());
        for write in &writes {
            if !seen.insert(&write.key) {
                return Err(StoreError::DuplicateWrite(write.key.clone()));
            }
            if write.record.kind() != write.key.kind {
                return Err(StoreError::Corrupt(write.key.clone()));
            }
            let current = tables.version_of(&write.key);
            let matches = match write.expect {
                Expect::Absent => current.is_none(),
                Expect::Version(expected) => current == Some(expected),
            };
            if !matches {
                debug!(key = %write.key, expected = ?write.expect, current = ?current, "commit rejected");
                return Err(StoreError::Conflict(write.key.clone()));
            }
        }

        let count = writes.len();
        for write in writes {
            let version = match write.expect {
                Expect::Absent => 1,
                Expect::Version(v) => v + 1,
            };
            tables.records.entry(write.key.kind).or_default().insert(
                write.key.id,
                Versioned {
                    version,
                    record: write.record,
                },
            );
        }
        debug!(writes = count, "batch committed");

        Ok(())
    }

    fn query(
        &self,
        kind: EntityKind,
        predicate: &dyn Fn(&Record) -> bool,
    ) -> Result<Vec<Versioned<Record>>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .records
            .get(&kind)
            .map(|table| {
                table
                    .values()
                    .filter(|row| predicate(&row.record))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn next_id(&self, kind: EntityKind) -> Result<u64, StoreError> {
        let mut tables = self.tables.write();
        let seq = tables.sequences.entry(kind).or_insert(0);
        *seq += 1;
        Ok(*seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IndexEntry, load_index};

    fn index(target: u64) -> Record {
        Record::Index(IndexEntry { target })
    }

    #[test]
    fn insert_then_update_bumps_version() {
        let store = MemoryStore::new();
        let key = RecordKey::index("a");

        let mut batch = Batch::new();
        batch.push(key.clone(), Expect::Absent, index(1));
        store.commit(batch).unwrap();
        assert_eq!(store.get(&key).unwrap().unwrap().version, 1);

        let mut batch = Batch::new();
        batch.push(key.clone(), Expect::Version(1), index(2));
        store.commit(batch).unwrap();

        let entry = load_index(&store, "a").unwrap().unwrap();
        assert_eq!(entry.version, 2);
        assert_eq!(entry.record.target, 2);
    }

    #[test]
    fn stale_version_conflicts() {
        let store = MemoryStore::new();
        let key = RecordKey::index("a");
        let mut batch = Batch::new();
        batch.push(key.clone(), Expect::Absent, index(1));
        store.commit(batch).unwrap();

        let mut batch = Batch::new();
        batch.push(key.clone(), Expect::Absent, index(9));
        assert_eq!(store.commit(batch), Err(StoreError::Conflict(key.clone())));

        let mut batch = Batch::new();
        batch.push(key.clone(), Expect::Version(7), index(9));
        assert_eq!(store.commit(batch), Err(StoreError::Conflict(key)));
    }

    #[test]
    fn failed_batch_applies_nothing() {
        let store = MemoryStore::new();
        let taken = RecordKey::index("taken");
        let mut batch = Batch::new();
        batch.push(taken.clone(), Expect::Absent, index(1));
        store.commit(batch).unwrap();

        let fresh = RecordKey::index("fresh");
        let mut batch = Batch::new();
        batch.push(fresh.clone(), Expect::Absent, index(2));
        batch.push(taken, Expect::Absent, index(3));
        assert!(store.commit(batch).is_err());

        assert!(store.get(&fresh).unwrap().is_none());
        assert_eq!(store.count(EntityKind::Index), 1);
    }

    #[test]
    fn duplicate_key_in_batch_is_rejected() {
        let store = MemoryStore::new();
        let key = RecordKey::index("a");
        let mut batch = Batch::new();
        batch.push(key.clone(), Expect::Absent, index(1));
        batch.push(key.clone(), Expect::Absent, index(2));
        assert_eq!(store.commit(batch), Err(StoreError::DuplicateWrite(key)));
    }

    #[test]
    fn sequences_are_per_kind() {
        let store = MemoryStore::new();
        assert_eq!(store.next_id(EntityKind::Offer).unwrap(), 1);
        assert_eq!(store.next_id(EntityKind::Offer).unwrap(), 2);
        assert_eq!(store.next_id(EntityKind::Deal).unwrap(), 1);
    }

    #[test]
    fn query_filters_by_kind_and_predicate() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch.push(RecordKey::index("a"), Expect::Absent, index(1));
        batch.push(RecordKey::index("b"), Expect::Absent, index(2));
        store.commit(batch).unwrap();

        let rows = store
            .query(EntityKind::Index, &|r: &Record| matches!(r, Record::Index(e) if e.target == 2))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(store.query(EntityKind::Offer, &|_: &Record| true).unwrap().is_empty());
    }
}
