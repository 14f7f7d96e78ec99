//! Administrative operations on an opened block-list table.

use std::{fmt, net::Ipv4Addr};

use clap::ValueEnum;
use serde_json::{Value, json};

use crate::{
    config::require_addr,
    error::{ConfigError, TableError},
    table::BlockTable,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum OpKind {
    Add,
    Del,
    Get,
    Dump,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Op {
    Add(Ipv4Addr),
    Del(Ipv4Addr),
    Get(Ipv4Addr),
    Dump,
}

impl Op {
    /// Pairs an operation with its address; every operation but dump needs one.
    pub fn from_parts(kind: OpKind, addr: Option<Ipv4Addr>) -> Result<Self, ConfigError> {
        Ok(match kind {
            OpKind::Add => Op::Add(require_addr("add", addr)?),
            OpKind::Del => Op::Del(require_addr("del", addr)?),
            OpKind::Get => Op::Get(require_addr("get", addr)?),
            OpKind::Dump => Op::Dump,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::Add(_) => "add",
            Op::Del(_) => "del",
            Op::Get(_) => "get",
            Op::Dump => "dump",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Report {
    Added { addr: Ipv4Addr, created: bool },
    Deleted { addr: Ipv4Addr, existed: bool },
    Counter { addr: Ipv4Addr, counter: Option<u64> },
    Dump(Vec<(Ipv4Addr, u64)>),
}

impl Report {
    pub fn to_json(&self) -> Value {
        match self {
            Report::Added { addr, created } => json!({
                "op": "add",
                "addr": addr.to_string(),
                "created": created,
            }),
            Report::Deleted { addr, existed } => json!({
                "op": "del",
                "addr": addr.to_string(),
                "existed": existed,
            }),
            Report::Counter { addr, counter } => json!({
                "op": "get",
                "addr": addr.to_string(),
                "counter": counter,
            }),
            Report::Dump(rows) => json!({
                "op": "dump",
                "entries": rows
                    .iter()
                    .map(|(addr, counter)| json!({ "addr": addr.to_string(), "counter": counter }))
                    .collect::<Vec<_>>(),
            }),
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Report::Added { addr, created } => {
                if *created {
                    writeln!(f, "add a new addr {addr} to fdrop map")?;
                }
                write!(f, "success to add addr {addr} to fdrop map")
            }
            Report::Deleted { addr, existed: true } => {
                write!(f, "success to delete addr {addr} from fdrop map")
            }
            Report::Deleted { addr, existed: false } => {
                write!(f, "addr {addr} doesn't exist in fdrop map")
            }
            Report::Counter { addr, counter: Some(counter) } => {
                write!(f, "the counter of addr {addr} is {counter}")
            }
            Report::Counter { addr, counter: None } => {
                write!(f, "addr {addr} not found in fdrop map")
            }
            Report::Dump(rows) => {
                for (i, (addr, counter)) in rows.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "addr {:<16}, counter: {counter}", addr.to_string())?;
                }
                Ok(())
            }
        }
    }
}

/// Runs `op` against `table`. Nothing is retried; a full table fails the add.
pub fn execute<T: BlockTable>(table: &T, op: Op) -> Result<Report, TableError> {
    match op {
        Op::Add(addr) => {
            let created = table.upsert_if_absent(addr.into())?;
            Ok(Report::Added { addr, created })
        }
        Op::Del(addr) => {
            let existed = table.remove(addr.into())?;
            Ok(Report::Deleted { addr, existed })
        }
        Op::Get(addr) => {
            let counter = table.get(addr.into())?;
            Ok(Report::Counter { addr, counter })
        }
        Op::Dump => {
            let rows: Vec<(Ipv4Addr, u64)> = table
                .entries()
                .map(|row| row.map(|(key, counter)| (key.into(), counter)))
                .collect::<Result<_, _>>()?;
            Ok(Report::Dump(rows))
        }
    }
}
