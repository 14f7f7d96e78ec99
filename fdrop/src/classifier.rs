//! Userspace rendition of the XDP classifier, for dry runs against a table.

use fdrop_common::{Increment, Verdict, frame};

use crate::table::BlockTable;

/// Classifies one Ethernet frame against `table`.
///
/// Fail-open: frames that are not IPv4 or whose headers do not parse pass.
/// A matching row is counted and the frame dropped. A row that disappears
/// mid-update, or a table error, aborts. Pinned kernel tables refuse
/// userspace increments, so every match against one aborts.
pub fn classify<T: BlockTable + ?Sized>(frame: &[u8], table: &T) -> Verdict {
    let Ok(src) = frame::ipv4_source(frame) else {
        return Verdict::Pass;
    };
    match table.increment_if_present(src) {
        Ok(outcome) => Verdict::from(outcome),
        Err(_) => Verdict::from(Increment::Vanished),
    }
}
