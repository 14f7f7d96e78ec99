use std::{collections::HashMap, sync::Arc};

use fdrop_common::Verdict;

use super::Datapath;
use crate::{
    classifier::classify,
    config::{AttachMode, TableName},
    error::AttachError,
    table::MemTable,
};

struct Activation {
    table: Arc<MemTable>,
    mode: AttachMode,
}

/// Runs the userspace classifier in-process, one activation per interface.
/// Frames are fed in with [`MemDatapath::receive`].
#[derive(Default)]
pub struct MemDatapath {
    loaded: Option<Arc<MemTable>>,
    active: HashMap<String, Activation>,
}

impl MemDatapath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn mode(&self, iface: &str) -> Option<AttachMode> {
        self.active.get(iface).map(|activation| activation.mode)
    }

    /// Delivers one frame on `iface`. `None` when nothing is attached there.
    pub fn receive(&self, iface: &str, frame: &[u8]) -> Option<Verdict> {
        let activation = self.active.get(iface)?;
        Some(classify(frame, &*activation.table))
    }
}

impl Datapath<Arc<MemTable>> for MemDatapath {
    fn bind(&mut self, _name: &TableName, table: Arc<MemTable>) -> Result<(), AttachError> {
        self.loaded = Some(table);
        Ok(())
    }

    fn is_attached(&self, iface: &str) -> Result<bool, AttachError> {
        Ok(self.active.contains_key(iface))
    }

    fn activate(&mut self, iface: &str, mode: AttachMode, force: bool) -> Result<(), AttachError> {
        if self.active.contains_key(iface) && !force {
            return Err(AttachError::AlreadyAttached {
                iface: iface.to_owned(),
            });
        }
        let table = self
            .loaded
            .clone()
            .ok_or_else(|| AttachError::Load {
                what: "no classifier loaded".to_owned(),
                source: None,
            })?;
        self.active
            .insert(iface.to_owned(), Activation { table, mode });
        Ok(())
    }

    fn deactivate(&mut self, iface: &str) -> Result<bool, AttachError> {
        Ok(self.active.remove(iface).is_some())
    }
}
