use std::{io, path::PathBuf};

use thiserror::Error;

use crate::table::Schema;

pub const EXIT_OK: u8 = 0;
pub const EXIT_FAIL_OPTION: u8 = 2;
pub const EXIT_FAIL_BPF: u8 = 40;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Bad or missing command-line input. Raised before anything is mutated.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required option --dev missing")]
    MissingDevice,
    #[error("--dev name unknown: {name}")]
    UnknownInterface {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("operation {op} requires --src-ip")]
    MissingAddress { op: &'static str },
    #[error("invalid table name segment {0:?}")]
    InvalidName(String),
    #[error("capacity must be greater than zero")]
    ZeroCapacity,
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("table {} is not registered", .0.display())]
    NotFound(PathBuf),
    #[error("table {} has schema {found}, expected {expected}", path.display())]
    SchemaMismatch {
        path: PathBuf,
        expected: Schema,
        found: Schema,
    },
    #[error("table {} is already registered", .0.display())]
    AlreadyRegistered(PathBuf),
    #[error("table is full ({capacity} rows)")]
    Full { capacity: u32 },
    #[error("counters of table {} are only advanced by the XDP classifier", .0.display())]
    KernelCounted(PathBuf),
    #[error("{call} on {} failed", path.display())]
    Syscall {
        call: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("map access on {} failed", path.display())]
    Map {
        path: PathBuf,
        #[source]
        source: aya::maps::MapError,
    },
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("a classifier is already attached to {iface}; use --force to replace it")]
    AlreadyAttached { iface: String },
    #[error("failed to load the classifier: {what}")]
    Load {
        what: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("failed to attach the classifier to {iface}")]
    Activate {
        iface: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to detach the classifier from {iface}")]
    Detach {
        iface: String,
        #[source]
        source: BoxError,
    },
}

impl AttachError {
    pub(crate) fn load(what: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Load {
            what: what.into(),
            source: Some(source.into()),
        }
    }
}

/// Coarse outcome class shared by both tools; each maps to one exit code.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExitClass {
    Ok,
    Config,
    Resource,
}

impl ExitClass {
    pub const fn code(self) -> u8 {
        match self {
            ExitClass::Ok => EXIT_OK,
            ExitClass::Config => EXIT_FAIL_OPTION,
            ExitClass::Resource => EXIT_FAIL_BPF,
        }
    }

    /// Classifies an error bubbled up to `main` by the first typed error in
    /// its chain. Anything unrecognised is treated as a resource failure.
    pub fn of(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if cause.is::<ConfigError>() || cause.is::<clap::Error>() {
                return ExitClass::Config;
            }
            if cause.is::<TableError>() || cause.is::<AttachError>() {
                return ExitClass::Resource;
            }
        }
        ExitClass::Resource
    }
}

/// Returns the OS error code carried anywhere in `err`'s source chain.
pub(crate) fn os_error(err: &(dyn std::error::Error + 'static)) -> Option<i32> {
    let mut cause = Some(err);
    while let Some(current) = cause {
        if let Some(io_err) = current.downcast_ref::<io::Error>() {
            if let Some(code) = io_err.raw_os_error() {
                return Some(code);
            }
        }
        cause = current.source();
    }
    None
}
