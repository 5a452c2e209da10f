//! Dispatch-Table Locator
//!
//! The table's address is not exported, so it is found by content: the
//! scanner walks candidate base addresses in pointer-sized strides and
//! matches one slot whose value is known in advance. The anchor slot
//! should belong to an operation nobody overrides (close, in practice),
//! so its value is trustworthy.
//!
//! # Edge Cases
//! - A scan that exhausts its range reports [`LocateError::NotFound`];
//!   the caller must not dereference a table it never found
//! - Unreadable candidates are skipped, not treated as a mismatch

use core::fmt;

use crate::mm::address::VirtAddr;

use super::table::{slot_addr, FnHandle, TableMemory, SLOT_SIZE};

/// A half-open range of candidate base addresses to scan.
#[derive(Debug, Clone, Copy)]
pub struct ScanRange {
    start: VirtAddr,
    end: VirtAddr,
}

impl ScanRange {
    /// Create a scan range over `[start, end)`.
    pub const fn new(start: VirtAddr, end: VirtAddr) -> Self {
        Self { start, end }
    }

    /// Iterate candidate base addresses in slot-sized strides.
    pub fn candidates(&self) -> Candidates {
        Candidates {
            next: self.start.as_usize(),
            end: self.end.as_usize(),
        }
    }
}

/// Iterator over candidate base addresses.
pub struct Candidates {
    next: usize,
    end: usize,
}

impl Iterator for Candidates {
    type Item = VirtAddr;

    fn next(&mut self) -> Option<VirtAddr> {
        if self.next >= self.end {
            return None;
        }
        let addr = VirtAddr::new_unchecked(self.next);
        self.next = self.next.saturating_add(SLOT_SIZE);
        Some(addr)
    }
}

/// The anchor used to recognize the table: slot `slot` must hold
/// `handle`.
#[derive(Debug, Clone, Copy)]
pub struct KnownSlot {
    /// Operation number of the anchor slot.
    pub slot: usize,
    /// Trusted entry-point handle expected there.
    pub handle: FnHandle,
}

/// Error type for table location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateError {
    /// No candidate in the range matched the anchor.
    NotFound,
}

impl fmt::Display for LocateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "dispatch table not found in scan range"),
        }
    }
}

/// Scan `range` for a table whose `known.slot` holds `known.handle`
/// and return the first matching base address.
pub fn locate<M: TableMemory>(
    mem: &M,
    range: ScanRange,
    known: KnownSlot,
) -> Result<VirtAddr, LocateError> {
    for base in range.candidates() {
        if mem.read(slot_addr(base, known.slot)) == Some(known.handle) {
            return Ok(base);
        }
    }
    Err(LocateError::NotFound)
}
