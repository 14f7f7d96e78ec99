//! Userspace side of fdrop, an XDP filter that drops IPv4 packets whose
//! source address is on a block-list and counts the drops per address.
//!
//! The block-list lives in a pinned kernel map shared by the classifier,
//! `fdrop-loader` and `fdrop-ctl`. Everything that touches it goes through
//! [`table::BlockTable`]; an in-memory implementation backs the tests.

pub mod attach;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod ebpf_loader;
pub mod error;
pub mod logging;
pub mod ops;
pub mod table;

pub use attach::{AttachController, AttachRequest, Attached, Datapath, Detached};
pub use classifier::classify;
pub use error::{AttachError, ConfigError, ExitClass, TableError};
pub use fdrop_common::{SrcKey, Verdict};
