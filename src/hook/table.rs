//! Dispatch-Table Access
//!
//! A dispatch table is an array of pointer-sized slots, each holding
//! the entry point for one operation. This module gives the table a
//! typed surface: slots hold opaque [`FnHandle`] values with defined
//! equality, and all reads/writes go through the [`TableMemory`]
//! capability so tests can supply a simulated table.
//!
//! # Security Properties
//! - Handles compare by value; nothing in the table model converts a
//!   handle back into a callable pointer
//! - Writes are only meaningful while the containing page is writable;
//!   backends are expected to reject anything else

use core::fmt;

use crate::mm::address::VirtAddr;

/// Size of one table slot.
pub const SLOT_SIZE: usize = core::mem::size_of::<usize>();

/// An opaque, pointer-sized function-handle value.
///
/// Exactly what a dispatch-table slot holds. Handles are compared,
/// stored and restored; they are never dereferenced here.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct FnHandle(usize);

impl FnHandle {
    /// The null handle (no function).
    pub const NULL: Self = Self(0);

    /// Create a handle from a raw slot value.
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Get the raw slot value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Check for the null handle.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for FnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FnHandle({:#x})", self.0)
    }
}

/// Address of slot `slot` in a table based at `base`.
#[inline]
pub const fn slot_addr(base: VirtAddr, slot: usize) -> VirtAddr {
    base.add(slot * SLOT_SIZE)
}

/// Error type for table-slot writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// The containing page is write-protected.
    Protected,
    /// The address is not backed by table memory.
    Fault,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protected => write!(f, "slot page is write-protected"),
            Self::Fault => write!(f, "slot address is not mapped"),
        }
    }
}

/// Capability for reading and writing pointer-sized table slots.
///
/// The production backend reads live kernel memory; the simulated
/// backend serves a synthetic table so locate/install/restore can run
/// in a host test harness.
pub trait TableMemory {
    /// Read the handle stored at `addr`, or `None` if the address is
    /// not readable table memory.
    fn read(&self, addr: VirtAddr) -> Option<FnHandle>;

    /// Store `handle` at `addr`. The containing page must currently be
    /// writable.
    fn write(&mut self, addr: VirtAddr, handle: FnHandle) -> Result<(), WriteError>;
}

/// Production table access: volatile loads and stores against the live
/// address space.
pub struct DirectMemory {
    _private: (),
}

impl DirectMemory {
    /// Create direct table access.
    ///
    /// # Safety
    /// Every address later passed to [`TableMemory::read`] or
    /// [`TableMemory::write`] on this value must be mapped kernel
    /// memory; reads of unmapped addresses fault rather than return
    /// `None`.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl TableMemory for DirectMemory {
    fn read(&self, addr: VirtAddr) -> Option<FnHandle> {
        if !addr.is_slot_aligned() {
            return None;
        }
        // SAFETY: The constructor contract puts mapped kernel memory
        // behind every address handed to this backend.
        let raw = unsafe { addr.as_ptr::<usize>().read_volatile() };
        Some(FnHandle::new(raw))
    }

    fn write(&mut self, addr: VirtAddr, handle: FnHandle) -> Result<(), WriteError> {
        if !addr.is_slot_aligned() {
            return Err(WriteError::Fault);
        }
        // SAFETY: As for read; the caller additionally holds the page
        // writable for the duration of the store.
        unsafe {
            addr.as_mut_ptr::<usize>().write_volatile(handle.as_usize());
        }
        Ok(())
    }
}
