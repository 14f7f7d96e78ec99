//! The block-list table shared by the classifier and the control tool.
//!
//! A table is a fixed-capacity map from [`SrcKey`] to a `u64` hit counter.
//! It is identified by a [`TableName`] and a [`Schema`]; every open checks the
//! schema of the registered table before any row is touched.
//!
//! Concurrency contract: every operation may run concurrently with any other,
//! from any number of threads or processes, without caller-side locking. Each
//! key's create/update/delete transition is atomic. Nothing spans keys, so a
//! walk with [`BlockTable::next_key`] is not a snapshot: under concurrent
//! mutation a key may be skipped or reported twice.

use std::{fmt, sync::Arc};

use fdrop_common::{Increment, KEY_SIZE, SrcKey, VALUE_SIZE};
use tracing::warn;

use crate::{config::TableName, error::TableError};

pub mod memory;
pub mod pinned;
mod sys;

pub use memory::{MemRegistry, MemTable};
pub use pinned::{BpfFs, PinnedTable};

/// Raw `BPF_MAP_TYPE_HASH`.
pub const BPF_MAP_TYPE_HASH: u32 = 1;

/// Hash map elements are allocated on insert and freed after a grace period,
/// so an element unlinked by a delete stays readable by a running classifier.
/// The classifier relies on this to notice a row deleted under it.
pub const BPF_F_NO_PREALLOC: u32 = 1;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StoreKind {
    Hash,
    Other(u32),
}

impl StoreKind {
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            BPF_MAP_TYPE_HASH => StoreKind::Hash,
            other => StoreKind::Other(other),
        }
    }

    pub const fn raw(self) -> u32 {
        match self {
            StoreKind::Hash => BPF_MAP_TYPE_HASH,
            StoreKind::Other(raw) => raw,
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Hash => f.write_str("hash"),
            StoreKind::Other(raw) => write!(f, "type {raw}"),
        }
    }
}

/// Signature a registered table must match to be reused.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Schema {
    pub key_size: u32,
    pub value_size: u32,
    pub capacity: u32,
    pub kind: StoreKind,
    pub flags: u32,
}

impl Schema {
    /// The block-list layout: 4 byte address key, 8 byte counter, hash store
    /// without preallocation.
    pub const fn blocklist(capacity: u32) -> Self {
        Self {
            key_size: KEY_SIZE,
            value_size: VALUE_SIZE,
            capacity,
            kind: StoreKind::Hash,
            flags: BPF_F_NO_PREALLOC,
        }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(key {}B, value {}B, {} rows, flags {:#x})",
            self.kind, self.key_size, self.value_size, self.capacity, self.flags
        )
    }
}

pub trait BlockTable {
    fn schema(&self) -> Schema;

    /// Inserts `key` with a zero counter unless it is already present.
    /// Returns whether a row was created; an existing counter is left alone.
    fn upsert_if_absent(&self, key: SrcKey) -> Result<bool, TableError>;

    /// Adds one to the counter of `key` if the row exists when the update
    /// commits.
    ///
    /// Tables whose rows are counted by the kernel classifier refuse this with
    /// [`TableError::KernelCounted`]; a userspace read-modify-write could lose
    /// hits the kernel adds in between.
    fn increment_if_present(&self, key: SrcKey) -> Result<Increment, TableError>;

    /// Deletes `key`. Returns whether a row was removed; an absent key is not
    /// an error.
    fn remove(&self, key: SrcKey) -> Result<bool, TableError>;

    fn get(&self, key: SrcKey) -> Result<Option<u64>, TableError>;

    /// Cursor step: the first key when `after` is `None` or no longer
    /// present, otherwise the key following `after`. `None` at the end.
    fn next_key(&self, after: Option<SrcKey>) -> Result<Option<SrcKey>, TableError>;

    /// Walks the table with [`next_key`](Self::next_key).
    fn entries(&self) -> Entries<'_, Self>
    where
        Self: Sized,
    {
        Entries::new(self)
    }
}

impl<T: BlockTable + ?Sized> BlockTable for &T {
    fn schema(&self) -> Schema {
        (**self).schema()
    }
    fn upsert_if_absent(&self, key: SrcKey) -> Result<bool, TableError> {
        (**self).upsert_if_absent(key)
    }
    fn increment_if_present(&self, key: SrcKey) -> Result<Increment, TableError> {
        (**self).increment_if_present(key)
    }
    fn remove(&self, key: SrcKey) -> Result<bool, TableError> {
        (**self).remove(key)
    }
    fn get(&self, key: SrcKey) -> Result<Option<u64>, TableError> {
        (**self).get(key)
    }
    fn next_key(&self, after: Option<SrcKey>) -> Result<Option<SrcKey>, TableError> {
        (**self).next_key(after)
    }
}

impl<T: BlockTable + ?Sized> BlockTable for Arc<T> {
    fn schema(&self) -> Schema {
        (**self).schema()
    }
    fn upsert_if_absent(&self, key: SrcKey) -> Result<bool, TableError> {
        (**self).upsert_if_absent(key)
    }
    fn increment_if_present(&self, key: SrcKey) -> Result<Increment, TableError> {
        (**self).increment_if_present(key)
    }
    fn remove(&self, key: SrcKey) -> Result<bool, TableError> {
        (**self).remove(key)
    }
    fn get(&self, key: SrcKey) -> Result<Option<u64>, TableError> {
        (**self).get(key)
    }
    fn next_key(&self, after: Option<SrcKey>) -> Result<Option<SrcKey>, TableError> {
        (**self).next_key(after)
    }
}

/// Named tables that outlive the processes using them.
pub trait Registry {
    type Table: BlockTable;

    /// Binds to the table registered under `name` after checking that it
    /// matches `expected`.
    fn open(&self, name: &TableName, expected: &Schema) -> Result<Self::Table, TableError>;

    /// Allocates an empty table and publishes it under `name`.
    fn create_and_register(
        &self,
        name: &TableName,
        schema: &Schema,
    ) -> Result<Self::Table, TableError>;

    /// Drops the registration. Handles already open stay usable until closed.
    /// Unregistering an unknown name succeeds.
    fn unregister(&self, name: &TableName) -> Result<(), TableError>;
}

impl<R: Registry + ?Sized> Registry for &R {
    type Table = R::Table;

    fn open(&self, name: &TableName, expected: &Schema) -> Result<Self::Table, TableError> {
        (**self).open(name, expected)
    }
    fn create_and_register(
        &self,
        name: &TableName,
        schema: &Schema,
    ) -> Result<Self::Table, TableError> {
        (**self).create_and_register(name, schema)
    }
    fn unregister(&self, name: &TableName) -> Result<(), TableError> {
        (**self).unregister(name)
    }
}

impl<R: Registry + ?Sized> Registry for Arc<R> {
    type Table = R::Table;

    fn open(&self, name: &TableName, expected: &Schema) -> Result<Self::Table, TableError> {
        (**self).open(name, expected)
    }
    fn create_and_register(
        &self,
        name: &TableName,
        schema: &Schema,
    ) -> Result<Self::Table, TableError> {
        (**self).create_and_register(name, schema)
    }
    fn unregister(&self, name: &TableName) -> Result<(), TableError> {
        (**self).unregister(name)
    }
}

/// Iterator over `(key, counter)` rows built on cursor iteration.
///
/// Rows deleted between the cursor step and the read are skipped. A cursor
/// that falls off a deleted key restarts from the first key, so the walk is
/// bounded to twice the table capacity.
pub struct Entries<'a, T> {
    table: &'a T,
    cursor: Option<SrcKey>,
    steps_left: usize,
    done: bool,
}

impl<'a, T: BlockTable> Entries<'a, T> {
    fn new(table: &'a T) -> Self {
        let capacity = table.schema().capacity as usize;
        Self {
            table,
            cursor: None,
            steps_left: capacity.saturating_mul(2).max(1),
            done: false,
        }
    }
}

impl<T: BlockTable> Iterator for Entries<'_, T> {
    type Item = Result<(SrcKey, u64), TableError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            if self.steps_left == 0 {
                warn!(
                    event.name = "table.walk_truncated",
                    "table walk stopped after too many steps; concurrent updates suspected"
                );
                self.done = true;
                break;
            }
            self.steps_left -= 1;

            let key = match self.table.next_key(self.cursor) {
                Ok(Some(key)) => key,
                Ok(None) => {
                    self.done = true;
                    break;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };
            self.cursor = Some(key);

            match self.table.get(key) {
                Ok(Some(counter)) => return Some(Ok((key, counter))),
                Ok(None) => continue,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}
