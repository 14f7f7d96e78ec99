//! The kernel datapath: loads the XDP object with its block-list map bound to
//! a pinned table and attaches it through bpf links.
//!
//! Persistent activations pin their link under the layout's link directory so
//! the classifier keeps running after the loader exits. Held activations keep
//! the link in-process and go away with it. Either way the link is owned apart
//! from the loaded object, so reloading the object never detaches anything.
//!
//! A forced re-attach swaps the new program into the existing link, so the
//! interface is never left without a classifier.

use std::{collections::HashMap, fs};

use aya::{
    Ebpf, EbpfLoader, include_bytes_aligned,
    programs::{
        Xdp, XdpFlags,
        links::{FdLink, PinnedLink},
        xdp::XdpLink,
    },
};
use fdrop_common::MAP_NAME;
use tracing::{debug, info};

use crate::{
    attach::Datapath,
    config::{AttachMode, ObjectSource, PinLayout, TableName},
    error::{AttachError, BoxError, os_error},
    table::{BlockTable, PinnedTable},
};

#[cfg(not(fdrop_no_embedded_ebpf))]
const EBPF_BYTES: Option<&[u8]> = Some(include_bytes_aligned!(concat!(
    env!("OUT_DIR"),
    "/fdrop"
)));
#[cfg(fdrop_no_embedded_ebpf)]
const EBPF_BYTES: Option<&[u8]> = None;

/// Whether activations outlive the loader process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkLifetime {
    Pinned,
    Held,
}

pub struct XdpDatapath {
    object: ObjectSource,
    program: String,
    layout: PinLayout,
    lifetime: LinkLifetime,
    ebpf: Option<Ebpf>,
    table: Option<PinnedTable>,
    held: HashMap<String, XdpLink>,
}

// A link found on the interface, about to receive a new program.
struct Existing {
    link: XdpLink,
    pinned: bool,
}

impl XdpDatapath {
    pub fn new(
        object: ObjectSource,
        program: &str,
        layout: PinLayout,
        lifetime: LinkLifetime,
    ) -> Self {
        Self {
            object,
            program: program.to_owned(),
            layout,
            lifetime,
            ebpf: None,
            table: None,
            held: HashMap::new(),
        }
    }

    /// The table the loaded classifier counts into.
    pub fn table(&self) -> Option<&PinnedTable> {
        self.table.as_ref()
    }

    fn load(&self, name: &TableName, capacity: u32) -> Result<Ebpf, AttachError> {
        let mut loader = EbpfLoader::new();
        loader.map_pin_path(name.dir());
        #[allow(deprecated)]
        loader.set_max_entries(MAP_NAME, capacity);

        let loaded = match &self.object {
            ObjectSource::Embedded => {
                let bytes = EBPF_BYTES.ok_or_else(|| AttachError::Load {
                    what: "this build has no embedded classifier object; pass --filename"
                        .to_owned(),
                    source: None,
                })?;
                loader.load(bytes)
            }
            ObjectSource::File(path) => loader.load_file(path),
        };
        let mut ebpf =
            loaded.map_err(|err| AttachError::load(format!("object {}", self.object), err))?;

        xdp_program(&mut ebpf, &self.program)?
            .load()
            .map_err(|err| AttachError::load(format!("program {}", self.program), err))?;
        Ok(ebpf)
    }

    // Removes whatever activation this datapath can see on `iface`: a link it
    // holds and a pinned link left by an earlier run.
    fn release(&mut self, iface: &str) -> Result<bool, AttachError> {
        let detach_err = |source: BoxError| AttachError::Detach {
            iface: iface.to_owned(),
            source,
        };
        // Dropping a held link detaches it.
        let mut released = self.held.remove(iface).is_some();

        let link_path = self.layout.link_path(iface);
        if link_path.exists() {
            let link = PinnedLink::from_pin(&link_path).map_err(|err| detach_err(err.into()))?;
            // Dropping the unpinned link closes the last reference and
            // detaches the program.
            drop(link.unpin().map_err(|err| detach_err(err.into()))?);
            debug!(
                event.name = "xdp.link_unpinned",
                network.interface.name = iface,
                link.path = %link_path.display(),
                "removed pinned link"
            );
            released = true;
        }
        Ok(released)
    }

    // Takes the link currently running on `iface`, held first, then pinned.
    // A pinned link stays pinned until its replacement is in place.
    fn existing_link(&mut self, iface: &str) -> Result<Option<Existing>, AttachError> {
        if let Some(link) = self.held.remove(iface) {
            return Ok(Some(Existing {
                link,
                pinned: false,
            }));
        }
        let link_path = self.layout.link_path(iface);
        if !link_path.exists() {
            return Ok(None);
        }
        let activate_err = |source: BoxError| activation_error(iface, source);
        let pinned = PinnedLink::from_pin(&link_path).map_err(|err| activate_err(err.into()))?;
        let link =
            XdpLink::try_from(FdLink::from(pinned)).map_err(|err| activate_err(err.into()))?;
        Ok(Some(Existing { link, pinned: true }))
    }
}

impl Datapath<PinnedTable> for XdpDatapath {
    fn bind(&mut self, name: &TableName, table: PinnedTable) -> Result<(), AttachError> {
        // The object pins its map by name, so only a table with that name can
        // be substituted for it.
        if name.table() != MAP_NAME {
            return Err(AttachError::Load {
                what: format!(
                    "the classifier map is named {MAP_NAME}; cannot bind table {}",
                    name.table()
                ),
                source: None,
            });
        }
        let ebpf = self.load(name, table.schema().capacity)?;
        info!(
            event.name = "xdp.loaded",
            object = %self.object,
            program = %self.program,
            table.path = %name,
            map.id = table.summary().id,
            "classifier loaded"
        );
        // Activations own their links, so the previous object can go.
        self.ebpf = Some(ebpf);
        self.table = Some(table);
        Ok(())
    }

    fn is_attached(&self, iface: &str) -> Result<bool, AttachError> {
        Ok(self.held.contains_key(iface) || self.layout.link_path(iface).exists())
    }

    fn activate(&mut self, iface: &str, mode: AttachMode, force: bool) -> Result<(), AttachError> {
        let activate_err = |source: BoxError| activation_error(iface, source);
        let link_path = self.layout.link_path(iface);
        // Nothing on the interface is touched until a program is loaded.
        if self.ebpf.is_none() {
            return Err(not_loaded());
        }
        let existing = if force {
            self.existing_link(iface)?
        } else {
            None
        };
        let replaced_pin = existing.as_ref().is_some_and(|existing| existing.pinned);

        let ebpf = self.ebpf.as_mut().ok_or_else(not_loaded)?;
        let program = xdp_program(ebpf, &self.program)?;
        let link_id = match existing {
            // The link keeps the mode it was created with.
            Some(existing) => {
                let link_id = program
                    .attach_to_link(existing.link)
                    .map_err(|err| activate_err(err.into()))?;
                debug!(
                    event.name = "xdp.link_updated",
                    network.interface.name = iface,
                    "swapped classifier into existing link"
                );
                link_id
            }
            None => program
                .attach(iface, xdp_flags(mode))
                .map_err(|err| activate_err(err.into()))?,
        };
        let link = program
            .take_link(link_id)
            .map_err(|err| activate_err(err.into()))?;

        match self.lifetime {
            LinkLifetime::Held => {
                if replaced_pin {
                    fs::remove_file(&link_path).map_err(|err| activate_err(err.into()))?;
                }
                self.held.insert(iface.to_owned(), link);
            }
            // The pin already refers to the updated link.
            LinkLifetime::Pinned if replaced_pin => drop(link),
            LinkLifetime::Pinned => {
                let link = FdLink::try_from(link).map_err(|err| activate_err(err.into()))?;
                if let Some(parent) = link_path.parent() {
                    fs::create_dir_all(parent).map_err(|err| activate_err(err.into()))?;
                }
                link.pin(&link_path)
                    .map_err(|err| activate_err(err.into()))?;
                debug!(
                    event.name = "xdp.link_pinned",
                    network.interface.name = iface,
                    link.path = %link_path.display(),
                    "pinned link"
                );
            }
        }
        Ok(())
    }

    fn deactivate(&mut self, iface: &str) -> Result<bool, AttachError> {
        self.release(iface)
    }
}

fn xdp_program<'a>(ebpf: &'a mut Ebpf, name: &str) -> Result<&'a mut Xdp, AttachError> {
    let program = ebpf.program_mut(name).ok_or_else(|| AttachError::Load {
        what: format!("program {name} not found in object"),
        source: None,
    })?;
    <&mut Xdp>::try_from(program)
        .map_err(|err| AttachError::load(format!("program {name} is not an XDP program"), err))
}

fn not_loaded() -> AttachError {
    AttachError::Load {
        what: "no classifier loaded".to_owned(),
        source: None,
    }
}

fn xdp_flags(mode: AttachMode) -> XdpFlags {
    match mode {
        AttachMode::Native => XdpFlags::DRV_MODE,
        AttachMode::Generic => XdpFlags::SKB_MODE,
        AttachMode::Auto => XdpFlags::default(),
    }
}

// The kernel reports an interface that already runs an XDP program as busy.
fn activation_error(iface: &str, source: BoxError) -> AttachError {
    match os_error(&*source) {
        Some(libc::EBUSY | libc::EEXIST) => AttachError::AlreadyAttached {
            iface: iface.to_owned(),
        },
        _ => AttachError::Activate {
            iface: iface.to_owned(),
            source,
        },
    }
}
