//! Hook Lifecycle Facade
//!
//! Wires the interceptor to the open/write wrappers and owns the
//! module-level serialization: the host serializes load against unload,
//! but nothing else serializes table mutation against wrapper-state
//! mutation, so one lock here brackets both.

use log::{info, warn};
use spin::Mutex;

use crate::mm::address::VirtAddr;
use crate::mm::protect::PageProtection;
use crate::sync::TryLock;

use super::interceptor::{HookSpec, InstallError, Interceptor, State, UninstallError};
use super::locate::{KnownSlot, ScanRange};
use super::nr;
use super::observe::{self, HostServices, OpenFn, WriteFn};
use super::table::{FnHandle, TableMemory};

/// Serializes engage/disengage against each other and against the
/// published wrapper state.
static LIFECYCLE: Mutex<()> = Mutex::new(());

/// At most one engagement may exist: a second install would back up
/// the wrappers themselves as "originals" and delegate into a loop.
static ENGAGED: TryLock = TryLock::new();

/// Engaged open/write hooks.
///
/// Holding this value is holding the installation; dropping it
/// restores the originals if `disengage` was never called.
#[derive(Debug)]
pub struct FileHooks<M: TableMemory, P: PageProtection> {
    interceptor: Interceptor<M, P>,
}

impl<M: TableMemory, P: PageProtection> FileHooks<M, P> {
    /// Locate the dispatch table and override the open and write
    /// entries with the observing wrappers.
    ///
    /// `known` anchors the scan (the close entry, in practice).
    /// `services` supplies caller-memory copies, task identity and
    /// descriptor resolution to the wrappers.
    pub fn engage(
        mem: M,
        prot: P,
        range: ScanRange,
        known: KnownSlot,
        services: &'static dyn HostServices,
    ) -> Result<Self, InstallError> {
        let _serial = LIFECYCLE.lock();

        if !ENGAGED.try_acquire() {
            return Err(InstallError::AlreadyInstalled);
        }

        observe::register_services(services);

        let hooks = [
            HookSpec {
                slot: nr::OPEN,
                replacement: FnHandle::new(observe::watched_open as OpenFn as usize),
                publish: Some(observe::publish_open),
            },
            HookSpec {
                slot: nr::WRITE,
                replacement: FnHandle::new(observe::watched_write as WriteFn as usize),
                publish: Some(observe::publish_write),
            },
        ];

        let mut interceptor = Interceptor::new(mem, prot);
        match interceptor.install(range, known, &hooks) {
            Ok(()) => {
                info!("file hooks engaged");
                Ok(Self { interceptor })
            }
            Err(e) => {
                observe::retract_originals();
                ENGAGED.release();
                warn!("file hooks not engaged: {}", e);
                Err(e)
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.interceptor.state()
    }

    /// Base address of the located table.
    pub fn table_base(&self) -> Option<VirtAddr> {
        self.interceptor.table_base()
    }

    /// Restore the original entries and invalidate the published
    /// originals.
    pub fn disengage(mut self) -> Result<(), UninstallError> {
        let _serial = LIFECYCLE.lock();
        let result = self.interceptor.uninstall();
        // Retract only once restore succeeded: while the wrappers are
        // still in the table they must keep delegating.
        if result.is_ok() {
            observe::retract_originals();
            ENGAGED.release();
            info!("file hooks disengaged");
        }
        result
    }
}

impl<M: TableMemory, P: PageProtection> Drop for FileHooks<M, P> {
    fn drop(&mut self) {
        // After an explicit disengage the state machine makes this a
        // no-op; otherwise dropping the value is the teardown.
        let _serial = LIFECYCLE.lock();
        if self.interceptor.state() == State::Installed {
            if self.interceptor.uninstall().is_ok() {
                observe::retract_originals();
                ENGAGED.release();
            } else {
                warn!("file hooks could not be restored on drop");
            }
        }
    }
}
