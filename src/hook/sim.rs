//! Simulated Kernel Backend
//!
//! A synthetic dispatch table with tracked page protection, standing in
//! for live kernel memory. Real kernel memory cannot be scanned or
//! patched from a test harness, so the locate/install/restore paths run
//! against this instead.
//!
//! Writes while the table is read-only are rejected, which makes a
//! missing protection toggle a test failure rather than a silent pass.

use spin::Mutex;

use crate::mm::address::VirtAddr;
use crate::mm::protect::{PageProtection, ProtectError};

use super::table::{FnHandle, TableMemory, WriteError, SLOT_SIZE};

#[derive(Debug)]
struct SimState<const N: usize> {
    slots: [FnHandle; N],
    writable: bool,
}

/// A simulated table of `N` slots based at a fixed address.
///
/// Implements both [`TableMemory`] and [`PageProtection`] through a
/// shared reference, so one instance can serve as the full backend of
/// an interceptor.
#[derive(Debug)]
pub struct SimKernel<const N: usize> {
    base: VirtAddr,
    state: Mutex<SimState<N>>,
}

impl<const N: usize> SimKernel<N> {
    /// Create a simulated table. It starts read-only, like the real
    /// thing.
    pub fn new(base: VirtAddr, slots: [FnHandle; N]) -> Self {
        Self {
            base,
            state: Mutex::new(SimState {
                slots,
                writable: false,
            }),
        }
    }

    /// Base address of the table.
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    /// Snapshot of all slots.
    pub fn slots(&self) -> [FnHandle; N] {
        self.state.lock().slots
    }

    /// Value of one slot.
    pub fn slot(&self, index: usize) -> FnHandle {
        self.state.lock().slots[index]
    }

    /// Current protection state.
    pub fn is_writable(&self) -> bool {
        self.state.lock().writable
    }

    fn index_of(&self, addr: VirtAddr) -> Option<usize> {
        let offset = addr.as_usize().checked_sub(self.base.as_usize())?;
        if offset % SLOT_SIZE != 0 {
            return None;
        }
        let index = offset / SLOT_SIZE;
        (index < N).then_some(index)
    }
}

impl<const N: usize> TableMemory for &SimKernel<N> {
    fn read(&self, addr: VirtAddr) -> Option<FnHandle> {
        let index = self.index_of(addr)?;
        Some(self.state.lock().slots[index])
    }

    fn write(&mut self, addr: VirtAddr, handle: FnHandle) -> Result<(), WriteError> {
        let index = self.index_of(addr).ok_or(WriteError::Fault)?;
        let mut state = self.state.lock();
        if !state.writable {
            return Err(WriteError::Protected);
        }
        state.slots[index] = handle;
        Ok(())
    }
}

impl<const N: usize> PageProtection for &SimKernel<N> {
    fn set_writable(&mut self, _addr: VirtAddr) -> Result<(), ProtectError> {
        self.state.lock().writable = true;
        Ok(())
    }

    fn set_read_only(&mut self, _addr: VirtAddr) -> Result<(), ProtectError> {
        self.state.lock().writable = false;
        Ok(())
    }
}
