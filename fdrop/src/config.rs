use std::{
    ffi::CString,
    fmt, io,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use fdrop_common::{DEFAULT_CAPACITY, MAP_NAME, PROGRAM_NAME};

use crate::{error::ConfigError, ops::Op};

pub const DEFAULT_PIN_ROOT: &str = "/sys/fs/bpf";
pub const DEFAULT_FEATURE: &str = "fdrop";
const LINKS_DIR: &str = "links";

/// Full identity of a table: the directory it is pinned in and its file name.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct TableName {
    dir: PathBuf,
    table: String,
}

impl TableName {
    pub fn new(dir: impl Into<PathBuf>, table: &str) -> Result<Self, ConfigError> {
        check_segment(table)?;
        Ok(Self {
            dir: dir.into(),
            table: table.to_owned(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.table)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path().display())
    }
}

/// Whether one table serves the whole host or each interface gets its own.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum PinScope {
    #[default]
    Shared,
    PerInterface,
}

/// Where tables and activations live in the pin namespace:
/// `<root>/<feature>[/<ifname>]/<table>` and `<root>/<feature>/links/<ifname>`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PinLayout {
    root: PathBuf,
    feature: String,
    table: String,
    scope: PinScope,
}

impl PinLayout {
    pub fn new(root: impl Into<PathBuf>, feature: &str) -> Result<Self, ConfigError> {
        check_segment(feature)?;
        Ok(Self {
            root: root.into(),
            feature: feature.to_owned(),
            table: MAP_NAME.to_owned(),
            scope: PinScope::Shared,
        })
    }

    pub fn with_table(mut self, table: &str) -> Result<Self, ConfigError> {
        check_segment(table)?;
        self.table = table.to_owned();
        Ok(self)
    }

    pub fn with_scope(mut self, scope: PinScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn feature_dir(&self) -> PathBuf {
        self.root.join(&self.feature)
    }

    pub fn table_name(&self, iface: &str) -> Result<TableName, ConfigError> {
        let dir = match self.scope {
            PinScope::Shared => self.feature_dir(),
            PinScope::PerInterface => {
                check_segment(iface)?;
                self.feature_dir().join(iface)
            }
        };
        TableName::new(dir, &self.table)
    }

    /// Pin path of the activation link for `iface`.
    pub fn link_path(&self, iface: &str) -> PathBuf {
        self.feature_dir().join(LINKS_DIR).join(iface)
    }
}

impl Default for PinLayout {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_PIN_ROOT),
            feature: DEFAULT_FEATURE.to_owned(),
            table: MAP_NAME.to_owned(),
            scope: PinScope::Shared,
        }
    }
}

fn check_segment(segment: &str) -> Result<(), ConfigError> {
    let bad = segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains('/')
        || segment.contains('\0');
    if bad {
        return Err(ConfigError::InvalidName(segment.to_owned()));
    }
    Ok(())
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum AttachMode {
    #[default]
    Native,
    Generic,
    Auto,
}

impl fmt::Display for AttachMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AttachMode::Native => "native",
            AttachMode::Generic => "skb",
            AttachMode::Auto => "auto",
        })
    }
}

/// A network interface that was resolved on this host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Interface {
    pub name: String,
    pub index: u32,
}

impl Interface {
    pub fn resolve(name: &str) -> Result<Self, ConfigError> {
        let unknown = |source| ConfigError::UnknownInterface {
            name: name.to_owned(),
            source,
        };
        let ifname = CString::new(name)
            .map_err(|err| unknown(io::Error::new(io::ErrorKind::InvalidInput, err)))?;
        let index = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
        if index == 0 {
            return Err(unknown(io::Error::last_os_error()));
        }
        Ok(Self {
            name: name.to_owned(),
            index,
        })
    }
}

/// Where the classifier object comes from.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum ObjectSource {
    /// The object compiled into the loader at build time.
    #[default]
    Embedded,
    File(PathBuf),
}

impl fmt::Display for ObjectSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectSource::Embedded => f.write_str("<embedded>"),
            ObjectSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoaderConfig {
    pub iface: Interface,
    pub layout: PinLayout,
    pub capacity: u32,
    pub mode: AttachMode,
    pub force: bool,
    pub unload: bool,
    pub purge: bool,
    pub foreground: bool,
    pub quiet: bool,
    pub object: ObjectSource,
    pub program: String,
}

impl LoaderConfig {
    pub fn new(iface: Interface, layout: PinLayout) -> Self {
        Self {
            iface,
            layout,
            capacity: DEFAULT_CAPACITY,
            mode: AttachMode::default(),
            force: false,
            unload: false,
            purge: false,
            foreground: false,
            quiet: false,
            object: ObjectSource::default(),
            program: PROGRAM_NAME.to_owned(),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct CtlConfig {
    pub iface: Interface,
    pub layout: PinLayout,
    pub capacity: u32,
    pub op: Op,
    pub output: OutputFormat,
    pub quiet: bool,
    pub verbose: bool,
}

pub(crate) fn check_capacity(capacity: u32) -> Result<u32, ConfigError> {
    if capacity == 0 {
        return Err(ConfigError::ZeroCapacity);
    }
    Ok(capacity)
}

pub(crate) fn require_addr(
    op: &'static str,
    addr: Option<Ipv4Addr>,
) -> Result<Ipv4Addr, ConfigError> {
    addr.ok_or(ConfigError::MissingAddress { op })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_layout_ignores_interface() {
        let layout = PinLayout::default();
        let name = layout.table_name("eth0").unwrap();
        assert_eq!(name.path(), PathBuf::from("/sys/fs/bpf/fdrop/fdrop_map_v1"));
        assert_eq!(name, layout.table_name("eth1").unwrap());
        assert_eq!(name.to_string(), "/sys/fs/bpf/fdrop/fdrop_map_v1");
    }

    #[test]
    fn per_interface_layout_adds_segment() {
        let layout = PinLayout::new("/run/bpf", "edge")
            .unwrap()
            .with_scope(PinScope::PerInterface);
        let name = layout.table_name("eth0").unwrap();
        assert_eq!(name.dir(), Path::new("/run/bpf/edge/eth0"));
        assert_eq!(name.table(), MAP_NAME);
        assert_ne!(name, layout.table_name("eth1").unwrap());
        assert!(layout.table_name("../etc").is_err());
    }

    #[test]
    fn link_path_lives_under_feature() {
        let layout = PinLayout::default();
        assert_eq!(
            layout.link_path("eth0"),
            PathBuf::from("/sys/fs/bpf/fdrop/links/eth0")
        );
    }

    #[test]
    fn rejects_bad_segments() {
        for bad in ["", ".", "..", "a/b", "nul\0"] {
            assert!(
                matches!(PinLayout::new("/sys/fs/bpf", bad), Err(ConfigError::InvalidName(_))),
                "{bad:?} accepted"
            );
        }
        assert!(PinLayout::default().with_table("fdrop_v2").is_ok());
        assert!(PinLayout::default().with_table("x/y").is_err());
    }

    #[test]
    fn unknown_interface_is_a_config_error() {
        let err = Interface::resolve("fdrop-no-such-if0").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownInterface { .. }));
        assert!(Interface::resolve("bad\0name").is_err());
    }

    #[test]
    fn capacity_and_address_checks() {
        assert!(check_capacity(0).is_err());
        assert_eq!(check_capacity(16).unwrap(), 16);
        assert!(matches!(
            require_addr("add", None),
            Err(ConfigError::MissingAddress { op: "add" })
        ));
    }
}
