//! Create-or-reuse the block-list table and activate the classifier on an
//! interface.

use tracing::{info, warn};

use crate::{
    config::{AttachMode, TableName},
    error::{AttachError, TableError},
    table::{Registry, Schema},
};

pub mod memory;

pub use memory::MemDatapath;

/// Where the classifier runs: loading it, binding its table, and switching
/// it on and off per interface.
pub trait Datapath<T> {
    /// Loads the classifier with its table reference bound to `table`.
    fn bind(&mut self, name: &TableName, table: T) -> Result<(), AttachError>;

    fn is_attached(&self, iface: &str) -> Result<bool, AttachError>;

    /// Activates the bound classifier on `iface`. With `force` an existing
    /// activation is replaced, otherwise it is an error.
    fn activate(&mut self, iface: &str, mode: AttachMode, force: bool) -> Result<(), AttachError>;

    /// Removes the activation on `iface`; returns whether there was one.
    fn deactivate(&mut self, iface: &str) -> Result<bool, AttachError>;
}

#[derive(Clone, Debug)]
pub struct AttachRequest<'a> {
    pub iface: &'a str,
    pub table: TableName,
    pub capacity: u32,
    pub mode: AttachMode,
    pub force: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attached {
    pub table: TableName,
    /// The table was created by this attach rather than reused.
    pub created: bool,
    /// An existing activation was replaced.
    pub replaced: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Detached {
    pub was_attached: bool,
    pub purged: bool,
}

pub struct AttachController<R, D> {
    registry: R,
    datapath: D,
}

impl<R, D> AttachController<R, D>
where
    R: Registry,
    D: Datapath<R::Table>,
{
    pub fn new(registry: R, datapath: D) -> Self {
        Self { registry, datapath }
    }

    pub fn datapath(&self) -> &D {
        &self.datapath
    }

    /// Attaches the classifier, reusing the registered table when its schema
    /// matches so running counters survive a re-attach.
    ///
    /// A table registered by this call is unregistered again if loading or
    /// activation fails. A table that already existed is never removed.
    pub fn attach(&mut self, req: &AttachRequest<'_>) -> Result<Attached, AttachError> {
        let schema = Schema::blocklist(req.capacity);
        let (table, created) = match self.registry.open(&req.table, &schema) {
            Ok(table) => {
                info!(
                    event.name = "attach.table_reused",
                    table.path = %req.table,
                    "reusing registered table"
                );
                (table, false)
            }
            Err(TableError::NotFound(_)) => {
                let table = self.registry.create_and_register(&req.table, &schema)?;
                (table, true)
            }
            Err(err) => return Err(err.into()),
        };

        match self.bind_and_activate(req, table) {
            Ok(replaced) => {
                info!(
                    event.name = "attach.activated",
                    network.interface.name = req.iface,
                    xdp.mode = %req.mode,
                    table.path = %req.table,
                    table.created = created,
                    replaced,
                    "classifier attached"
                );
                Ok(Attached {
                    table: req.table.clone(),
                    created,
                    replaced,
                })
            }
            Err(err) => {
                if created {
                    self.roll_back(&req.table);
                }
                Err(err)
            }
        }
    }

    fn bind_and_activate(
        &mut self,
        req: &AttachRequest<'_>,
        table: R::Table,
    ) -> Result<bool, AttachError> {
        // Refused before loading, so a live classifier is left as it was.
        let existing = self.datapath.is_attached(req.iface)?;
        if existing && !req.force {
            return Err(AttachError::AlreadyAttached {
                iface: req.iface.to_owned(),
            });
        }
        self.datapath.bind(&req.table, table)?;
        self.datapath.activate(req.iface, req.mode, req.force)?;
        Ok(existing)
    }

    fn roll_back(&self, name: &TableName) {
        match self.registry.unregister(name) {
            Ok(()) => info!(
                event.name = "attach.rolled_back",
                table.path = %name,
                "unregistered table created by the failed attach"
            ),
            Err(err) => warn!(
                event.name = "attach.rollback_failed",
                table.path = %name,
                error = %err,
                "could not unregister table created by the failed attach"
            ),
        }
    }

    /// Removes the activation on `iface`. The table registration stays unless
    /// `purge` asks for it to go too.
    pub fn detach(
        &mut self,
        iface: &str,
        table: &TableName,
        purge: bool,
    ) -> Result<Detached, AttachError> {
        let was_attached = self.datapath.deactivate(iface)?;
        if purge {
            self.registry.unregister(table)?;
        }
        info!(
            event.name = "attach.detached",
            network.interface.name = iface,
            was_attached,
            purged = purge,
            "classifier detached"
        );
        Ok(Detached {
            was_attached,
            purged: purge,
        })
    }
}
