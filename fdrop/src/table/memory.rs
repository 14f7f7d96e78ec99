//! In-process tables with the same contract as the pinned ones.
//!
//! Rows live in [`COUNTER_SHARDS`] ordered shards behind reader/writer locks;
//! counters are shared atomics so the hit path only ever takes read locks.

use std::{
    collections::{BTreeMap, HashMap as StdHashMap, hash_map::DefaultHasher},
    hash::{Hash, Hasher},
    ops::Bound,
    path::PathBuf,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use fdrop_common::{Increment, SrcKey};

use super::{BlockTable, Registry, Schema};
use crate::{config::TableName, error::TableError};

pub const COUNTER_SHARDS: usize = 64;

type Shard = BTreeMap<SrcKey, Arc<AtomicU64>>;

pub struct MemTable {
    schema: Schema,
    shards: Vec<RwLock<Shard>>,
    len: AtomicUsize,
}

impl MemTable {
    pub fn new(schema: Schema) -> Self {
        let mut shards = Vec::with_capacity(COUNTER_SHARDS);
        for _ in 0..COUNTER_SHARDS {
            shards.push(RwLock::new(BTreeMap::new()));
        }
        Self {
            schema,
            shards,
            len: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard_index(&self, key: &SrcKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len().max(1)
    }

    fn row(&self, key: &SrcKey) -> Option<Arc<AtomicU64>> {
        let shard = self.shards[self.shard_index(key)]
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        shard.get(key).cloned()
    }

    // Claims one unit of capacity, failing once the table is full.
    fn reserve(&self) -> Result<(), TableError> {
        let capacity = self.schema.capacity as usize;
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                (len < capacity).then_some(len + 1)
            })
            .map(drop)
            .map_err(|_| TableError::Full {
                capacity: self.schema.capacity,
            })
    }

    // Same protocol as the XDP program: find the row, add in place, then
    // check the row is still the one that was bumped. `before_recheck` runs
    // between the add and the check.
    fn bump(&self, key: SrcKey, before_recheck: impl FnOnce()) -> Increment {
        let Some(row) = self.row(&key) else {
            return Increment::NotPresent;
        };
        row.fetch_add(1, Ordering::AcqRel);
        before_recheck();
        match self.row(&key) {
            Some(current) if Arc::ptr_eq(&current, &row) => Increment::Incremented,
            _ => Increment::Vanished,
        }
    }

    fn first_key_from(&self, shard_idx: usize) -> Option<SrcKey> {
        self.shards[shard_idx..].iter().find_map(|shard| {
            let shard = shard.read().unwrap_or_else(PoisonError::into_inner);
            shard.keys().next().copied()
        })
    }
}

impl BlockTable for MemTable {
    fn schema(&self) -> Schema {
        self.schema
    }

    fn upsert_if_absent(&self, key: SrcKey) -> Result<bool, TableError> {
        let mut shard = self.shards[self.shard_index(&key)]
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if shard.contains_key(&key) {
            return Ok(false);
        }
        self.reserve()?;
        shard.insert(key, Arc::new(AtomicU64::new(0)));
        Ok(true)
    }

    fn increment_if_present(&self, key: SrcKey) -> Result<Increment, TableError> {
        Ok(self.bump(key, || {}))
    }

    fn remove(&self, key: SrcKey) -> Result<bool, TableError> {
        let mut shard = self.shards[self.shard_index(&key)]
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let removed = shard.remove(&key).is_some();
        if removed {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(removed)
    }

    fn get(&self, key: SrcKey) -> Result<Option<u64>, TableError> {
        Ok(self.row(&key).map(|row| row.load(Ordering::Acquire)))
    }

    // Order is (shard, key). A cursor that was deleted keeps its position
    // because its shard is derived from the key alone.
    fn next_key(&self, after: Option<SrcKey>) -> Result<Option<SrcKey>, TableError> {
        let Some(after) = after else {
            return Ok(self.first_key_from(0));
        };
        let idx = self.shard_index(&after);
        let in_shard = {
            let shard = self.shards[idx]
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            shard
                .range((Bound::Excluded(after), Bound::Unbounded))
                .next()
                .map(|(key, _)| *key)
        };
        match in_shard {
            Some(key) => Ok(Some(key)),
            None if idx + 1 < self.shards.len() => Ok(self.first_key_from(idx + 1)),
            None => Ok(None),
        }
    }
}

/// Process-local registry of [`MemTable`]s keyed by table path.
#[derive(Default)]
pub struct MemRegistry {
    tables: Mutex<StdHashMap<PathBuf, Arc<MemTable>>>,
}

impl MemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, name: &TableName) -> bool {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&name.path())
    }
}

impl Registry for MemRegistry {
    type Table = Arc<MemTable>;

    fn open(&self, name: &TableName, expected: &Schema) -> Result<Arc<MemTable>, TableError> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let path = name.path();
        let table = tables
            .get(&path)
            .ok_or_else(|| TableError::NotFound(path.clone()))?;
        let found = table.schema();
        if found != *expected {
            return Err(TableError::SchemaMismatch {
                path,
                expected: *expected,
                found,
            });
        }
        Ok(Arc::clone(table))
    }

    fn create_and_register(
        &self,
        name: &TableName,
        schema: &Schema,
    ) -> Result<Arc<MemTable>, TableError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let path = name.path();
        if tables.contains_key(&path) {
            return Err(TableError::AlreadyRegistered(path));
        }
        let table = Arc::new(MemTable::new(*schema));
        tables.insert(path, Arc::clone(&table));
        Ok(table)
    }

    fn unregister(&self, name: &TableName) -> Result<(), TableError> {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name.path());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, thread};

    use fdrop_common::Verdict;

    use super::*;
    use crate::config::PinLayout;

    fn key(last: u8) -> SrcKey {
        SrcKey::from_octets([10, 0, 0, last])
    }

    fn table(capacity: u32) -> MemTable {
        MemTable::new(Schema::blocklist(capacity))
    }

    #[test]
    fn upsert_creates_once_and_keeps_counter() {
        let t = table(8);
        assert!(t.upsert_if_absent(key(5)).unwrap());
        assert_eq!(t.get(key(5)).unwrap(), Some(0));
        assert_eq!(
            t.increment_if_present(key(5)).unwrap(),
            Increment::Incremented
        );
        assert!(!t.upsert_if_absent(key(5)).unwrap());
        assert_eq!(t.get(key(5)).unwrap(), Some(1));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn increment_of_absent_key_is_not_present() {
        let t = table(8);
        assert_eq!(
            t.increment_if_present(key(9)).unwrap(),
            Increment::NotPresent
        );
        assert_eq!(t.get(key(9)).unwrap(), None);
    }

    #[test]
    fn row_deleted_mid_increment_vanishes() {
        let t = table(8);
        t.upsert_if_absent(key(5)).unwrap();
        t.increment_if_present(key(5)).unwrap();

        let outcome = t.bump(key(5), || {
            assert_eq!(t.get(key(5)).unwrap(), Some(2));
            assert!(t.remove(key(5)).unwrap());
        });
        assert_eq!(outcome, Increment::Vanished);
        assert_eq!(Verdict::from(outcome), Verdict::Aborted);
        assert_eq!(t.get(key(5)).unwrap(), None);
    }

    #[test]
    fn row_replaced_mid_increment_keeps_fresh_counter() {
        let t = table(8);
        t.upsert_if_absent(key(5)).unwrap();

        let outcome = t.bump(key(5), || {
            t.remove(key(5)).unwrap();
            t.upsert_if_absent(key(5)).unwrap();
        });
        assert_eq!(outcome, Increment::Vanished);
        // The hit landed on the unlinked row, not on its replacement.
        assert_eq!(t.get(key(5)).unwrap(), Some(0));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let t = table(8);
        t.upsert_if_absent(key(1)).unwrap();
        assert!(t.remove(key(1)).unwrap());
        assert!(!t.remove(key(1)).unwrap());
        assert!(!t.remove(key(2)).unwrap());
        assert!(t.is_empty());
    }

    #[test]
    fn capacity_is_enforced_without_touching_rows() {
        let t = table(3);
        for last in 1..=3 {
            assert!(t.upsert_if_absent(key(last)).unwrap());
        }
        t.increment_if_present(key(2)).unwrap();

        let err = t.upsert_if_absent(key(4)).unwrap_err();
        assert!(matches!(err, TableError::Full { capacity: 3 }));
        assert_eq!(t.get(key(4)).unwrap(), None);
        assert_eq!(t.get(key(1)).unwrap(), Some(0));
        assert_eq!(t.get(key(2)).unwrap(), Some(1));
        assert_eq!(t.get(key(3)).unwrap(), Some(0));

        // An existing key is still reported, not rejected, when full.
        assert!(!t.upsert_if_absent(key(1)).unwrap());

        // Freeing a row frees capacity.
        t.remove(key(3)).unwrap();
        assert!(t.upsert_if_absent(key(4)).unwrap());
    }

    #[test]
    fn cursor_visits_every_key_once() {
        let t = table(300);
        let expected: HashSet<SrcKey> = (0..=255u8).map(key).collect();
        for k in &expected {
            t.upsert_if_absent(*k).unwrap();
        }

        let mut seen = HashSet::new();
        let mut cursor = None;
        while let Some(next) = t.next_key(cursor).unwrap() {
            assert!(seen.insert(next), "{next} visited twice");
            cursor = Some(next);
        }
        assert_eq!(seen, expected);
    }

    #[test]
    fn cursor_survives_deleted_position() {
        let t = table(16);
        for last in 1..=10 {
            t.upsert_if_absent(key(last)).unwrap();
        }
        let first = t.next_key(None).unwrap().unwrap();
        let second = t.next_key(Some(first)).unwrap();
        t.remove(first).unwrap();
        assert_eq!(t.next_key(Some(first)).unwrap(), second);
    }

    #[test]
    fn empty_table_has_no_first_key() {
        assert_eq!(table(4).next_key(None).unwrap(), None);
        assert_eq!(table(4).entries().count(), 0);
    }

    #[test]
    fn entries_reports_counters() {
        let t = table(8);
        t.upsert_if_absent(key(1)).unwrap();
        t.upsert_if_absent(key(2)).unwrap();
        t.increment_if_present(key(2)).unwrap();
        t.increment_if_present(key(2)).unwrap();

        let mut rows: Vec<_> = t.entries().collect::<Result<_, _>>().unwrap();
        rows.sort();
        assert_eq!(rows, vec![(key(1), 0), (key(2), 2)]);
    }

    #[test]
    fn concurrent_hits_are_all_counted() {
        let t = Arc::new(table(4));
        t.upsert_if_absent(key(7)).unwrap();

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let t = Arc::clone(&t);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        assert_eq!(
                            t.increment_if_present(key(7)).unwrap(),
                            Increment::Incremented
                        );
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(t.get(key(7)).unwrap(), Some(8000));
    }

    #[test]
    fn concurrent_upserts_respect_capacity() {
        let t = Arc::new(table(100));
        let workers: Vec<_> = (0..4u8)
            .map(|w| {
                let t = Arc::clone(&t);
                thread::spawn(move || {
                    let mut created = 0;
                    for last in 0..=255u8 {
                        match t.upsert_if_absent(SrcKey::from_octets([10, w, 0, last])) {
                            Ok(true) => created += 1,
                            Ok(false) => unreachable!("keys are distinct"),
                            Err(TableError::Full { .. }) => {}
                            Err(err) => panic!("{err}"),
                        }
                    }
                    created
                })
            })
            .collect();
        let created: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
        assert_eq!(created, 100);
        assert_eq!(t.len(), 100);
        assert_eq!(t.entries().count(), 100);
    }

    #[test]
    fn registry_validates_schema_and_uniqueness() {
        let registry = MemRegistry::new();
        let name = PinLayout::default().table_name("eth0").unwrap();
        let schema = Schema::blocklist(16);

        assert!(matches!(
            registry.open(&name, &schema),
            Err(TableError::NotFound(_))
        ));
        let created = registry.create_and_register(&name, &schema).unwrap();
        created.upsert_if_absent(key(1)).unwrap();
        assert!(matches!(
            registry.create_and_register(&name, &schema),
            Err(TableError::AlreadyRegistered(_))
        ));

        let reopened = registry.open(&name, &schema).unwrap();
        assert_eq!(reopened.get(key(1)).unwrap(), Some(0));

        let err = registry.open(&name, &Schema::blocklist(32)).err().unwrap();
        assert!(matches!(err, TableError::SchemaMismatch { .. }));

        registry.unregister(&name).unwrap();
        assert!(!registry.is_registered(&name));
        registry.unregister(&name).unwrap();
        // Handles opened before unregistering keep working.
        assert_eq!(reopened.get(key(1)).unwrap(), Some(0));
    }

    #[test]
    fn preallocated_table_is_not_reused() {
        let registry = MemRegistry::new();
        let name = PinLayout::default().table_name("eth0").unwrap();
        let preallocated = Schema {
            flags: 0,
            ..Schema::blocklist(16)
        };
        registry.create_and_register(&name, &preallocated).unwrap();

        let err = registry.open(&name, &Schema::blocklist(16)).err().unwrap();
        assert!(matches!(
            err,
            TableError::SchemaMismatch { found, .. } if found.flags == 0
        ));
        assert_eq!(
            err.to_string(),
            "table /sys/fs/bpf/fdrop/fdrop_map_v1 has schema hash(key 4B, value 8B, 16 rows, \
             flags 0x0), expected hash(key 4B, value 8B, 16 rows, flags 0x1)"
        );
    }
}
