//! Interception State Machine
//!
//! Owns the located table, the saved originals, and the install /
//! uninstall sequencing:
//!
//! ```text
//! Uninstalled --locate--> Located --swap--> Installed
//!      ^                                        |
//!      +----------------restore----------------+
//! ```
//!
//! # Security Properties
//! - Nothing is mutated before the table is located and every target
//!   slot is backed up; a failed locate leaves no side effects
//! - The table page is writable only between the two protection
//!   toggles inside install/uninstall; every exit path re-protects
//! - A partial overwrite is unwound before reporting failure, so
//!   installation is all-or-nothing
//! - Restore refuses to touch memory unless an install actually
//!   completed

use log::{debug, info, warn};

use crate::mm::address::VirtAddr;
use crate::mm::protect::{PageProtection, ProtectError};

use super::locate::{locate, KnownSlot, LocateError, ScanRange};
use super::table::{slot_addr, FnHandle, TableMemory};

/// Most entries an interceptor can override at once.
pub const MAX_HOOKS: usize = 8;

/// Installation lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No table known, nothing overridden.
    Uninstalled,
    /// Table base known, original entries untouched.
    Located,
    /// Target slots overridden; originals saved.
    Installed,
}

/// One requested override.
#[derive(Debug, Clone, Copy)]
pub struct HookSpec {
    /// Operation number of the slot to override.
    pub slot: usize,
    /// Handle to write into the slot.
    pub replacement: FnHandle,
    /// Called with the saved original before any slot is overwritten,
    /// so the replacement can delegate from its first invocation.
    pub publish: Option<fn(FnHandle)>,
}

/// A saved original entry, captured exactly once before the overwrite.
#[derive(Debug, Clone, Copy)]
struct SavedEntry {
    slot: usize,
    handle: FnHandle,
}

/// Error type for installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallError {
    /// Hooks are already installed.
    AlreadyInstalled,
    /// More hooks requested than [`MAX_HOOKS`].
    TooManyHooks,
    /// The scan exhausted its range without finding the table.
    TableNotFound,
    /// The table page's protection could not be resolved.
    Protection(ProtectError),
    /// A target slot could not be read or written.
    SlotFault,
}

impl core::fmt::Display for InstallError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyInstalled => write!(f, "hooks already installed"),
            Self::TooManyHooks => write!(f, "too many hooks requested"),
            Self::TableNotFound => write!(f, "dispatch table not found"),
            Self::Protection(e) => write!(f, "protection toggle failed: {}", e),
            Self::SlotFault => write!(f, "table slot inaccessible"),
        }
    }
}

/// Error type for restoration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallError {
    /// The table page's protection could not be resolved.
    Protection(ProtectError),
    /// A saved entry could not be written back.
    SlotFault,
}

impl core::fmt::Display for UninstallError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Protection(e) => write!(f, "protection toggle failed: {}", e),
            Self::SlotFault => write!(f, "saved entry could not be restored"),
        }
    }
}

/// Locates a dispatch table, overrides selected slots, and guarantees
/// exact restoration of the originals.
///
/// Install and uninstall take `&mut self` and are expected to be
/// serialized by the caller; the host does not do it for us.
#[derive(Debug)]
pub struct Interceptor<M: TableMemory, P: PageProtection> {
    mem: M,
    prot: P,
    state: State,
    table: Option<VirtAddr>,
    saved: [Option<SavedEntry>; MAX_HOOKS],
    saved_len: usize,
}

impl<M: TableMemory, P: PageProtection> Interceptor<M, P> {
    /// Create an interceptor over the given backends.
    pub fn new(mem: M, prot: P) -> Self {
        Self {
            mem,
            prot,
            state: State::Uninstalled,
            table: None,
            saved: [None; MAX_HOOKS],
            saved_len: 0,
        }
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    /// Base address of the located table, if any.
    #[inline]
    pub fn table_base(&self) -> Option<VirtAddr> {
        self.table
    }

    fn clear_saved(&mut self) {
        self.saved = [None; MAX_HOOKS];
        self.saved_len = 0;
    }

    /// Locate the table and override the requested slots.
    ///
    /// On any error the table is left exactly as found: nothing has
    /// been overwritten and the page is read-only again.
    pub fn install(
        &mut self,
        range: ScanRange,
        known: KnownSlot,
        hooks: &[HookSpec],
    ) -> Result<(), InstallError> {
        if self.state == State::Installed {
            return Err(InstallError::AlreadyInstalled);
        }
        if hooks.len() > MAX_HOOKS {
            return Err(InstallError::TooManyHooks);
        }

        let base = match locate(&self.mem, range, known) {
            Ok(base) => base,
            Err(LocateError::NotFound) => {
                warn!("dispatch table not found; nothing installed");
                return Err(InstallError::TableNotFound);
            }
        };
        self.table = Some(base);
        self.state = State::Located;
        debug!("dispatch table located at {}", base);

        // Back up every target before touching anything, and hand the
        // originals to the replacements so delegation works from the
        // first dispatched call.
        self.clear_saved();
        for (i, hook) in hooks.iter().enumerate() {
            let handle = self
                .mem
                .read(slot_addr(base, hook.slot))
                .ok_or(InstallError::SlotFault)?;
            self.saved[i] = Some(SavedEntry {
                slot: hook.slot,
                handle,
            });
            if let Some(publish) = hook.publish {
                publish(handle);
            }
        }
        self.saved_len = hooks.len();

        if let Err(e) = self.prot.set_writable(base) {
            warn!("cannot unprotect table page: {}", e);
            self.clear_saved();
            return Err(InstallError::Protection(e));
        }

        for (i, hook) in hooks.iter().enumerate() {
            if self
                .mem
                .write(slot_addr(base, hook.slot), hook.replacement)
                .is_err()
            {
                self.unwind(i);
                self.clear_saved();
                return Err(InstallError::SlotFault);
            }
        }

        if let Err(e) = self.prot.set_read_only(base) {
            // The overwrite succeeded but the page cannot be
            // re-protected; back the slots out rather than run hooked
            // on a page in an unknown protection state.
            self.unwind(hooks.len());
            self.clear_saved();
            return Err(InstallError::Protection(e));
        }

        self.state = State::Installed;
        info!("{} table entries overridden at {}", hooks.len(), base);
        Ok(())
    }

    /// Write back the first `count` saved entries and re-protect.
    /// Used on failed installs; the page is writable on entry.
    fn unwind(&mut self, count: usize) {
        let base = match self.table {
            Some(base) => base,
            None => return,
        };
        for saved in self.saved.iter().take(count).flatten() {
            let _ = self.mem.write(slot_addr(base, saved.slot), saved.handle);
        }
        if self.prot.set_read_only(base).is_err() {
            warn!("table page left in unknown protection state");
        }
    }

    /// Restore every overridden slot to its saved original.
    ///
    /// A no-op unless an install completed: the table reference is
    /// checked before any memory is touched.
    pub fn uninstall(&mut self) -> Result<(), UninstallError> {
        let base = match (self.state, self.table) {
            (State::Installed, Some(base)) => base,
            _ => {
                self.state = State::Uninstalled;
                self.table = None;
                return Ok(());
            }
        };

        self.prot
            .set_writable(base)
            .map_err(UninstallError::Protection)?;

        let mut failed = false;
        for saved in self.saved.iter().take(self.saved_len).flatten() {
            if self
                .mem
                .write(slot_addr(base, saved.slot), saved.handle)
                .is_err()
            {
                failed = true;
            }
        }

        let reprotect = self.prot.set_read_only(base);

        self.clear_saved();
        self.state = State::Uninstalled;
        self.table = None;

        if failed {
            return Err(UninstallError::SlotFault);
        }
        reprotect.map_err(UninstallError::Protection)?;
        info!("original table entries restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::sim::SimKernel;
    use crate::hook::table::WriteError;
    use crate::mm::address::VirtAddr;

    const BASE: usize = 0xFFFF_0000_4000_0000;

    fn known() -> KnownSlot {
        KnownSlot {
            slot: 2,
            handle: FnHandle::new(0xAA),
        }
    }

    fn scan() -> ScanRange {
        ScanRange::new(VirtAddr::new(BASE), VirtAddr::new(BASE + 4096))
    }

    /// The concrete scenario: 4 slots, slot 2 anchors at 0xAA, slots 0
    /// and 1 get overridden with W0/W1 and restored to O0/O1.
    fn four_slot_table() -> SimKernel<4> {
        SimKernel::new(
            VirtAddr::new(BASE + 128),
            [
                FnHandle::new(0x100), // O0
                FnHandle::new(0x200), // O1
                FnHandle::new(0xAA),
                FnHandle::new(0x400),
            ],
        )
    }

    #[test]
    fn test_install_overrides_and_uninstall_restores() {
        let sim = four_slot_table();
        let initial = sim.slots();
        let mut ic = Interceptor::new(&sim, &sim);

        let w0 = FnHandle::new(0xE0);
        let w1 = FnHandle::new(0xE1);
        let hooks = [
            HookSpec { slot: 0, replacement: w0, publish: None },
            HookSpec { slot: 1, replacement: w1, publish: None },
        ];

        ic.install(scan(), known(), &hooks).unwrap();
        assert_eq!(ic.state(), State::Installed);
        assert_eq!(sim.slot(0), w0);
        assert_eq!(sim.slot(1), w1);
        // The anchor and the untouched slot are untouched
        assert_eq!(sim.slot(2), FnHandle::new(0xAA));
        assert_eq!(sim.slot(3), FnHandle::new(0x400));
        // No dangling writable window after install
        assert!(!sim.is_writable());

        ic.uninstall().unwrap();
        assert_eq!(ic.state(), State::Uninstalled);
        assert_eq!(sim.slots(), initial);
        assert!(!sim.is_writable());
    }

    #[test]
    fn test_locate_failure_leaves_no_side_effects() {
        let sim = four_slot_table();
        let initial = sim.slots();
        let mut ic = Interceptor::new(&sim, &sim);

        let missing = KnownSlot {
            slot: 2,
            handle: FnHandle::new(0xBB),
        };
        let hooks = [HookSpec {
            slot: 0,
            replacement: FnHandle::new(0xE0),
            publish: None,
        }];

        assert_eq!(
            ic.install(scan(), missing, &hooks),
            Err(InstallError::TableNotFound)
        );
        assert_eq!(ic.state(), State::Uninstalled);
        assert_eq!(sim.slots(), initial);
        assert!(!sim.is_writable());
    }

    #[test]
    fn test_uninstall_without_install_is_a_noop() {
        let sim = four_slot_table();
        let initial = sim.slots();
        let mut ic = Interceptor::new(&sim, &sim);

        ic.uninstall().unwrap();
        assert_eq!(ic.state(), State::Uninstalled);
        assert_eq!(sim.slots(), initial);
    }

    #[test]
    fn test_double_install_is_rejected() {
        let sim = four_slot_table();
        let mut ic = Interceptor::new(&sim, &sim);
        let hooks = [HookSpec {
            slot: 0,
            replacement: FnHandle::new(0xE0),
            publish: None,
        }];

        ic.install(scan(), known(), &hooks).unwrap();
        assert_eq!(
            ic.install(scan(), known(), &hooks),
            Err(InstallError::AlreadyInstalled)
        );
    }

    #[test]
    fn test_publish_hands_out_original_before_overwrite() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        static SEEN: AtomicUsize = AtomicUsize::new(0);

        fn capture(handle: FnHandle) {
            SEEN.store(handle.as_usize(), Ordering::SeqCst);
        }

        let sim = four_slot_table();
        let mut ic = Interceptor::new(&sim, &sim);
        let hooks = [HookSpec {
            slot: 0,
            replacement: FnHandle::new(0xE0),
            publish: Some(capture),
        }];

        ic.install(scan(), known(), &hooks).unwrap();
        assert_eq!(SEEN.load(Ordering::SeqCst), 0x100);
    }

    /// Protection backend that refuses to unprotect.
    struct NoUnprotect;

    impl PageProtection for NoUnprotect {
        fn set_writable(&mut self, _: VirtAddr) -> Result<(), ProtectError> {
            Err(ProtectError::Unmapped)
        }
        fn set_read_only(&mut self, _: VirtAddr) -> Result<(), ProtectError> {
            Ok(())
        }
    }

    #[test]
    fn test_protection_failure_aborts_before_mutation() {
        let sim = four_slot_table();
        let initial = sim.slots();
        let mut ic = Interceptor::new(&sim, NoUnprotect);
        let hooks = [HookSpec {
            slot: 0,
            replacement: FnHandle::new(0xE0),
            publish: None,
        }];

        assert_eq!(
            ic.install(scan(), known(), &hooks),
            Err(InstallError::Protection(ProtectError::Unmapped))
        );
        assert_eq!(sim.slots(), initial);
        assert!(!sim.is_writable());
        // Table was located before the failure
        assert_eq!(ic.state(), State::Located);
    }

    /// Table memory that forwards to the sim but fails one write,
    /// counted across the install sequence.
    struct FailingWrites<'a> {
        sim: &'a SimKernel<4>,
        fail_at: usize,
        writes: usize,
    }

    impl TableMemory for FailingWrites<'_> {
        fn read(&self, addr: VirtAddr) -> Option<FnHandle> {
            self.sim.read(addr)
        }

        fn write(&mut self, addr: VirtAddr, handle: FnHandle) -> Result<(), WriteError> {
            let n = self.writes;
            self.writes += 1;
            if n == self.fail_at {
                return Err(WriteError::Fault);
            }
            let mut mem = self.sim;
            mem.write(addr, handle)
        }
    }

    #[test]
    fn test_partial_overwrite_is_unwound() {
        let sim = four_slot_table();
        let initial = sim.slots();

        // First overwrite lands, second fails mid-sequence.
        let mem = FailingWrites {
            sim: &sim,
            fail_at: 1,
            writes: 0,
        };
        let mut ic = Interceptor::new(mem, &sim);
        let hooks = [
            HookSpec { slot: 0, replacement: FnHandle::new(0xE0), publish: None },
            HookSpec { slot: 1, replacement: FnHandle::new(0xE1), publish: None },
        ];

        assert_eq!(
            ic.install(scan(), known(), &hooks),
            Err(InstallError::SlotFault)
        );
        // The slot-0 overwrite was backed out again: all or nothing.
        assert_eq!(sim.slots(), initial);
        assert!(!sim.is_writable());
        assert_eq!(ic.state(), State::Located);
    }

    /// Forwards to the sim for a limited number of unprotects, then
    /// keeps reporting success without actually unprotecting.
    struct StickyProtection<'a> {
        sim: &'a SimKernel<4>,
        unprotects: usize,
    }

    impl PageProtection for StickyProtection<'_> {
        fn set_writable(&mut self, addr: VirtAddr) -> Result<(), ProtectError> {
            if self.unprotects == 0 {
                return Ok(());
            }
            self.unprotects -= 1;
            let mut prot = self.sim;
            prot.set_writable(addr)
        }

        fn set_read_only(&mut self, addr: VirtAddr) -> Result<(), ProtectError> {
            let mut prot = self.sim;
            prot.set_read_only(addr)
        }
    }

    #[test]
    fn test_restore_write_failure_is_reported() {
        let sim = four_slot_table();
        let prot = StickyProtection {
            sim: &sim,
            unprotects: 1,
        };
        let mut ic = Interceptor::new(&sim, prot);

        let w0 = FnHandle::new(0xE0);
        let hooks = [HookSpec {
            slot: 0,
            replacement: w0,
            publish: None,
        }];
        ic.install(scan(), known(), &hooks).unwrap();
        assert_eq!(sim.slot(0), w0);

        // The page never becomes writable again, so writing back the
        // saved entry fails; the failure is surfaced, not swallowed.
        assert_eq!(ic.uninstall(), Err(UninstallError::SlotFault));
        assert_eq!(sim.slot(0), w0);
        assert!(!sim.is_writable());
    }
}
