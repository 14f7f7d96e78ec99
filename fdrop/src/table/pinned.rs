//! Tables backed by a kernel BPF hash map pinned in bpffs.
//!
//! The pin file is the registration: any process that can see the bpffs
//! mount reaches the same map through its path, across restarts, until the
//! pin is removed.

use std::{
    fs, io,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use aya::maps::{HashMap, Map, MapData, MapError};
use fdrop_common::{Increment, SrcKey};
use tracing::{debug, info, warn};

use super::{BlockTable, Registry, Schema, StoreKind, sys};
use crate::{config::TableName, error::TableError};

const BPF_NOEXIST: u64 = 1;

/// Registry of pinned tables. Stateless: everything lives in bpffs.
#[derive(Copy, Clone, Debug, Default)]
pub struct BpfFs;

/// Kernel facts about an opened map, for diagnostics.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MapSummary {
    pub id: u32,
    pub name: String,
    pub schema: Schema,
}

pub struct PinnedTable {
    path: PathBuf,
    summary: MapSummary,
    map: Mutex<HashMap<MapData, SrcKey, u64>>,
    // Cursor walks need the raw next-key step, which aya only offers as a
    // whole-map iterator.
    fd: OwnedFd,
}

impl PinnedTable {
    pub fn summary(&self) -> &MapSummary {
        &self.summary
    }

    fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<MapData, SrcKey, u64>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn map_error(&self, source: MapError) -> TableError {
        TableError::Map {
            path: self.path.clone(),
            source,
        }
    }
}

impl BlockTable for PinnedTable {
    fn schema(&self) -> Schema {
        self.summary.schema
    }

    fn upsert_if_absent(&self, key: SrcKey) -> Result<bool, TableError> {
        match self.map().insert(key, 0u64, BPF_NOEXIST) {
            Ok(()) => Ok(true),
            Err(err) => match errno(&err) {
                Some(libc::EEXIST) => Ok(false),
                Some(libc::E2BIG) => Err(TableError::Full {
                    capacity: self.summary.schema.capacity,
                }),
                _ => Err(self.map_error(err)),
            },
        }
    }

    // Only the XDP program adds to kernel rows; it does so in place.
    fn increment_if_present(&self, _key: SrcKey) -> Result<Increment, TableError> {
        Err(TableError::KernelCounted(self.path.clone()))
    }

    fn remove(&self, key: SrcKey) -> Result<bool, TableError> {
        match self.map().remove(&key) {
            Ok(()) => Ok(true),
            Err(err) if errno(&err) == Some(libc::ENOENT) => Ok(false),
            Err(err) => Err(self.map_error(err)),
        }
    }

    fn get(&self, key: SrcKey) -> Result<Option<u64>, TableError> {
        match self.map().get(&key, 0) {
            Ok(counter) => Ok(Some(counter)),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(err) => Err(self.map_error(err)),
        }
    }

    fn next_key(&self, after: Option<SrcKey>) -> Result<Option<SrcKey>, TableError> {
        sys::next_key(self.fd(), after).map_err(|source| TableError::Syscall {
            call: "BPF_MAP_GET_NEXT_KEY",
            path: self.path.clone(),
            source,
        })
    }
}

impl Registry for BpfFs {
    type Table = PinnedTable;

    fn open(&self, name: &TableName, expected: &Schema) -> Result<PinnedTable, TableError> {
        let path = name.path();
        let map_err = |source| TableError::Map {
            path: path.clone(),
            source,
        };

        let map_data = match MapData::from_pin(&path) {
            Ok(map_data) => map_data,
            Err(err) if is_not_found(&err) => return Err(TableError::NotFound(path.clone())),
            Err(err) => return Err(map_err(err)),
        };

        let info = map_data.info().map_err(map_err)?;
        let kind = info.map_type().map_err(map_err)?;
        let found = Schema {
            key_size: info.key_size(),
            value_size: info.value_size(),
            capacity: info.max_entries(),
            kind: StoreKind::from_raw(kind as u32),
            flags: info.map_flags(),
        };
        if found != *expected {
            return Err(TableError::SchemaMismatch {
                path: path.clone(),
                expected: *expected,
                found,
            });
        }
        let summary = MapSummary {
            id: info.id(),
            name: info.name_as_str().unwrap_or_default().to_owned(),
            schema: found,
        };

        let fd = map_data
            .fd()
            .as_fd()
            .try_clone_to_owned()
            .map_err(|source| TableError::Syscall {
                call: "F_DUPFD_CLOEXEC",
                path: path.clone(),
                source,
            })?;
        // aya 0.13.1 has no Map::from_map_data; the schema check above has
        // already verified the kernel map type is BPF_MAP_TYPE_HASH.
        let map = Map::HashMap(map_data);
        let map = HashMap::<_, SrcKey, u64>::try_from(map).map_err(map_err)?;

        debug!(
            event.name = "table.opened",
            table.path = %path.display(),
            map.id = summary.id,
            map.name = %summary.name,
            "opened pinned table"
        );
        Ok(PinnedTable {
            path,
            summary,
            map: Mutex::new(map),
            fd,
        })
    }

    fn create_and_register(
        &self,
        name: &TableName,
        schema: &Schema,
    ) -> Result<PinnedTable, TableError> {
        let path = name.path();
        let dir_created = !name.dir().exists();
        fs::create_dir_all(name.dir()).map_err(|source| TableError::Syscall {
            call: "mkdir",
            path: name.dir().to_path_buf(),
            source,
        })?;
        let created_dir = dir_created.then(|| name.dir());

        if let Err(err) = pin_new_map(name, schema) {
            discard_registration(None, created_dir);
            return Err(err);
        }
        info!(
            event.name = "table.registered",
            table.path = %path.display(),
            table.capacity = schema.capacity,
            "created and pinned table"
        );

        self.open(name, schema).inspect_err(|_| {
            discard_registration(Some(&path), created_dir);
        })
    }

    fn unregister(&self, name: &TableName) -> Result<(), TableError> {
        let path = name.path();
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(
                    event.name = "table.unregistered",
                    table.path = %path.display(),
                    "removed table pin"
                );
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(TableError::Syscall {
                call: "unlink",
                path,
                source,
            }),
        }
    }
}

// Creates the map and pins it at the table path. The creation handle is closed
// on return; the pin keeps the map alive.
fn pin_new_map(name: &TableName, schema: &Schema) -> Result<(), TableError> {
    let path = name.path();
    let sys_err = |call: &'static str| {
        let path = path.clone();
        move |source: io::Error| TableError::Syscall { call, path, source }
    };

    let fd = sys::map_create(
        schema.kind.raw(),
        schema.key_size,
        schema.value_size,
        schema.capacity,
        schema.flags,
        name.table(),
    )
    .map_err(sys_err("BPF_MAP_CREATE"))?;

    match sys::obj_pin(fd.as_fd(), &path) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::EEXIST) => {
            Err(TableError::AlreadyRegistered(path.clone()))
        }
        Err(err) => Err(sys_err("BPF_OBJ_PIN")(err)),
    }
}

// Undoes a registration that could not be completed. A directory is only
// removed when this registration created it and it is empty again.
fn discard_registration(pin: Option<&Path>, dir: Option<&Path>) {
    if let Some(pin) = pin {
        match fs::remove_file(pin) {
            Ok(()) => debug!(
                event.name = "table.pin_discarded",
                table.path = %pin.display(),
                "removed pin of unusable table"
            ),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                event.name = "table.pin_discard_failed",
                table.path = %pin.display(),
                error = %err,
                "could not remove pin of unusable table"
            ),
        }
    }
    if let Some(dir) = dir {
        let _ = fs::remove_dir(dir);
    }
}

fn errno(err: &MapError) -> Option<i32> {
    match err {
        MapError::SyscallError(err) => err.io_error.raw_os_error(),
        _ => None,
    }
}

fn is_not_found(err: &MapError) -> bool {
    match err {
        MapError::SyscallError(err) => err.io_error.kind() == io::ErrorKind::NotFound,
        _ => false,
    }
}
