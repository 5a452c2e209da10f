//! Syscall-Table Interposition
//!
//! Locates the kernel's dispatch table by content, overrides the open
//! and write entries with observing wrappers, and restores the
//! originals exactly on teardown.
//!
//! # Security Model
//! - The table is only writable inside the two narrow toggle windows
//!   in install/uninstall
//! - A failed install leaves no side effects; restore is all-or-nothing
//!   against the saved originals
//! - Wrappers are transparent: same calling contract, same return
//!   value, observation as the only added effect

pub mod interceptor;
pub mod locate;
pub mod observe;
pub mod sim;
pub mod table;

mod engine;

pub use engine::FileHooks;
pub use interceptor::{HookSpec, InstallError, Interceptor, State, UninstallError};
pub use locate::{locate, KnownSlot, LocateError, ScanRange};
pub use observe::{register_services, HostServices, OpenFlags};
pub use table::{DirectMemory, FnHandle, TableMemory};

/// Stable operation numbers for the dispatch table.
///
/// The numbering follows the x86_64 convention the table is scanned
/// with; close anchors the scan because nothing overrides it.
pub mod nr {
    pub const WRITE: usize = 1;
    pub const OPEN: usize = 2;
    pub const CLOSE: usize = 3;
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Shared fixtures for tests that touch process-wide wrapper state.

    use std::sync::{Mutex, MutexGuard};

    use crate::task::{DescriptorPaths, TaskContext, COMM_MAX};
    use crate::usercopy::{CopyError, UserMem, UserPtr};

    /// Published originals and registered services are process-wide;
    /// tests that touch them hold this lock for their duration.
    static WRAPPER_STATE: Mutex<()> = Mutex::new(());

    pub fn wrapper_state() -> MutexGuard<'static, ()> {
        WRAPPER_STATE.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The one caller address [`StubHost`] accepts for path copies.
    pub const STUB_PATH_PTR: usize = 0x5000;

    /// Fixed-behavior host services shared by wrapper and lifecycle
    /// tests. Only ever registered as the process-wide services, so
    /// every test sees the same behavior regardless of ordering.
    pub struct StubHost;

    impl UserMem for StubHost {
        fn copy_from_user(&self, dst: &mut [u8], src: UserPtr) -> Result<usize, CopyError> {
            if src.as_usize() != STUB_PATH_PTR {
                return Err(CopyError::BadAddress);
            }
            let data = b"/tmp/stub\0";
            let n = data.len().min(dst.len());
            dst[..n].copy_from_slice(&data[..n]);
            Ok(n)
        }

        fn copy_to_user(&self, _dst: UserPtr, _src: &[u8]) -> Result<usize, CopyError> {
            Err(CopyError::BadAddress)
        }
    }

    impl TaskContext for StubHost {
        fn pid(&self) -> u32 {
            42
        }

        fn comm(&self, out: &mut [u8; COMM_MAX]) -> usize {
            out[..4].copy_from_slice(b"stub");
            4
        }
    }

    impl DescriptorPaths for StubHost {
        fn path_of(&self, fd: u32, out: &mut [u8]) -> Option<usize> {
            if fd != 3 {
                return None;
            }
            let path = b"/tmp/stub-file";
            out[..path.len()].copy_from_slice(path);
            Some(path.len())
        }
    }
}
