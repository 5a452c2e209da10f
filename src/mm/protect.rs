//! Page Write-Protection Toggle
//!
//! Flips the page containing a given virtual address between read-only
//! and writable by resolving the descriptor that maps it and toggling
//! the access-permission bit.
//!
//! # Security Properties
//! - Both operations are idempotent; callers may bracket a critical
//!   section without tracking prior state
//! - Protection is toggled on the containing page (or block), never on
//!   a raw pointer: granularity is whatever descriptor maps the address
//! - An unresolvable mapping is a hard error. Callers must abort before
//!   mutating anything behind an address they could not resolve.

use core::ptr::NonNull;

use super::address::{PhysAddr, VirtAddr};
use super::paging::{PageTable, PageTableEntry};

/// Error type for protection-toggle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectError {
    /// No valid descriptor maps the address.
    Unmapped,
}

impl core::fmt::Display for ProtectError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Unmapped => write!(f, "address is not mapped"),
        }
    }
}

/// Capability for toggling write permission on the page containing an
/// address.
///
/// The production backend walks live page tables; tests substitute a
/// simulated backend so the toggle sequence can be exercised without a
/// kernel underneath.
pub trait PageProtection {
    /// Make the page containing `addr` writable. Idempotent.
    fn set_writable(&mut self, addr: VirtAddr) -> Result<(), ProtectError>;

    /// Restore the page containing `addr` to read-only. Idempotent.
    fn set_read_only(&mut self, addr: VirtAddr) -> Result<(), ProtectError>;
}

/// Resolves the physical address of a page-table frame to a pointer the
/// kernel can dereference.
pub trait TableTranslator {
    /// Pointer to the table stored at `phys`, or None if the frame is
    /// outside the translator's window.
    fn table_ptr(&self, phys: PhysAddr) -> Option<NonNull<PageTable>>;
}

/// Direct-map translator: table frames live at a fixed offset between
/// physical and virtual addresses.
#[derive(Debug, Clone, Copy)]
pub struct LinearTranslator {
    phys_base: usize,
    virt_base: usize,
}

impl LinearTranslator {
    /// Create a translator for a direct-map window.
    ///
    /// # Safety
    /// Every table frame later resolved through this translator must
    /// actually be mapped at `virt_base + (phys - phys_base)`.
    pub const unsafe fn new(phys_base: usize, virt_base: usize) -> Self {
        Self {
            phys_base,
            virt_base,
        }
    }

    /// Identity window: physical and virtual addresses coincide.
    /// Used by host-side tests where tables live in ordinary memory.
    pub const fn identity() -> Self {
        Self {
            phys_base: 0,
            virt_base: 0,
        }
    }
}

impl TableTranslator for LinearTranslator {
    fn table_ptr(&self, phys: PhysAddr) -> Option<NonNull<PageTable>> {
        let p = phys.as_usize();
        if p < self.phys_base {
            return None;
        }
        let virt = self.virt_base + (p - self.phys_base);
        NonNull::new(virt as *mut PageTable)
    }
}

/// Production protection toggle: walks a 4-level table hierarchy from
/// `root` and flips the access-permission bit on the descriptor that
/// maps the target address.
///
/// Descriptor updates are volatile so the hardware walker observes them.
pub struct PteProtection<X: TableTranslator> {
    root: PhysAddr,
    xlate: X,
}

impl<X: TableTranslator> PteProtection<X> {
    /// Create a toggle rooted at the given L0 table.
    pub const fn new(root: PhysAddr, xlate: X) -> Self {
        Self { root, xlate }
    }

    /// Resolve the descriptor mapping `virt`.
    ///
    /// Follows table descriptors down to L3; stops early at a block
    /// descriptor (L1/L2), which maps the address at coarser
    /// granularity and is then the descriptor to toggle.
    fn lookup_entry(&self, virt: VirtAddr) -> Result<NonNull<PageTableEntry>, ProtectError> {
        let (l0, l1, l2, l3) = virt.page_table_indices();

        let mut table = self
            .xlate
            .table_ptr(self.root)
            .ok_or(ProtectError::Unmapped)?;

        for (level, index) in [(0usize, l0), (1, l1), (2, l2)] {
            // SAFETY: `table` came from the translator, which only
            // hands out pointers to live table frames; index is a
            // 9-bit field and therefore in range.
            let slot = unsafe { PageTable::entry_raw(table, index) };
            // SAFETY: `slot` points into a live table.
            let entry = unsafe { slot.as_ptr().read_volatile() };

            if !entry.is_valid() {
                return Err(ProtectError::Unmapped);
            }
            if level > 0 && entry.is_block_descriptor() {
                return Ok(slot);
            }
            if !entry.is_table_descriptor() {
                return Err(ProtectError::Unmapped);
            }

            table = self
                .xlate
                .table_ptr(entry.addr())
                .ok_or(ProtectError::Unmapped)?;
        }

        // SAFETY: As above; L3 index is a 9-bit field.
        let slot = unsafe { PageTable::entry_raw(table, l3) };
        // SAFETY: `slot` points into a live table.
        let entry = unsafe { slot.as_ptr().read_volatile() };
        if !entry.is_valid() {
            return Err(ProtectError::Unmapped);
        }
        Ok(slot)
    }

    fn update(
        &mut self,
        addr: VirtAddr,
        apply: fn(&mut PageTableEntry),
    ) -> Result<(), ProtectError> {
        let slot = self.lookup_entry(addr.page_base())?;
        // SAFETY: `slot` was resolved by lookup_entry and points at a
        // live descriptor; volatile read-modify-write keeps the update
        // visible to the hardware walker.
        unsafe {
            let mut entry = slot.as_ptr().read_volatile();
            apply(&mut entry);
            slot.as_ptr().write_volatile(entry);
        }
        Ok(())
    }
}

impl<X: TableTranslator> PageProtection for PteProtection<X> {
    fn set_writable(&mut self, addr: VirtAddr) -> Result<(), ProtectError> {
        self.update(addr, PageTableEntry::make_writable)
    }

    fn set_read_only(&mut self, addr: VirtAddr) -> Result<(), ProtectError> {
        self.update(addr, PageTableEntry::make_read_only)
    }
}
