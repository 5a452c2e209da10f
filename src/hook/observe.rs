//! Syscall Wrapper Functions
//!
//! Replacements for the open and write table entries. Each wrapper has
//! byte-for-byte the calling contract of the entry it replaces: it
//! derives a human-readable identifier from its arguments, emits one
//! observation record, then calls the saved original with the
//! arguments unchanged and returns its result unchanged.
//!
//! # Concurrency
//! Wrappers run on arbitrary tasks at arbitrary times once installed.
//! They take no locks: per-call state lives on the stack, and the only
//! shared state is read-only (the published originals in atomics, the
//! host services behind a one-time cell).
//!
//! # Failure Semantics
//! Observation is best-effort. If the identifier cannot be derived
//! (bad caller pointer, unresolvable descriptor), the record is
//! skipped and the call is still delegated; the underlying operation
//! never depends on the observation.

use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;
use log::info;
use spin::Once;

use crate::task::{DescriptorPaths, TaskContext, COMM_MAX};
use crate::usercopy::{UserMem, UserPtr};

use super::table::FnHandle;

/// Bound on copied path names, terminator included.
pub const PATH_MAX: usize = 1024;

/// Returned when a wrapper is dispatched with no published original.
const ENOSYS: i64 = -38;

/// Calling contract of the open entry.
pub type OpenFn = unsafe extern "C" fn(path: UserPtr, flags: u32, mode: u32) -> i64;

/// Calling contract of the write entry.
pub type WriteFn = unsafe extern "C" fn(fd: u32, buf: UserPtr, count: usize) -> i64;

bitflags! {
    /// open(2) access flags decoded into observation records.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRONLY   = 0o1;
        const RDWR     = 0o2;
        const CREAT    = 0o100;
        const EXCL     = 0o200;
        const TRUNC    = 0o1000;
        const APPEND   = 0o2000;
        const NONBLOCK = 0o4000;
    }
}

/// Everything the wrappers need from the host, as one object-safe
/// bundle.
pub trait HostServices: UserMem + TaskContext + DescriptorPaths + Sync {}

impl<T> HostServices for T where T: UserMem + TaskContext + DescriptorPaths + Sync {}

static SERVICES: Once<&'static dyn HostServices> = Once::new();

// Originals published by the interceptor before the table swap and
// cleared after restore. Zero means "not installed".
static SAVED_OPEN: AtomicUsize = AtomicUsize::new(0);
static SAVED_WRITE: AtomicUsize = AtomicUsize::new(0);

/// Register the host services the wrappers observe with.
///
/// First registration wins; later calls are ignored. Wrappers invoked
/// before registration skip observation and still delegate.
pub fn register_services(services: &'static dyn HostServices) {
    SERVICES.call_once(|| services);
}

fn services() -> Option<&'static dyn HostServices> {
    SERVICES.get().copied()
}

pub(crate) fn publish_open(handle: FnHandle) {
    SAVED_OPEN.store(handle.as_usize(), Ordering::Release);
}

pub(crate) fn publish_write(handle: FnHandle) {
    SAVED_WRITE.store(handle.as_usize(), Ordering::Release);
}

/// Invalidate the published originals after restore.
pub(crate) fn retract_originals() {
    SAVED_OPEN.store(0, Ordering::Release);
    SAVED_WRITE.store(0, Ordering::Release);
}

#[cfg(test)]
pub(crate) fn published_open() -> FnHandle {
    FnHandle::new(SAVED_OPEN.load(Ordering::Acquire))
}

#[cfg(test)]
pub(crate) fn published_write() -> FnHandle {
    FnHandle::new(SAVED_WRITE.load(Ordering::Acquire))
}

/// Identity of the calling task, captured per call.
struct Ident {
    pid: u32,
    comm: [u8; COMM_MAX],
    comm_len: usize,
}

impl Ident {
    fn of(svc: &dyn HostServices) -> Self {
        let mut comm = [0u8; COMM_MAX];
        let comm_len = svc.comm(&mut comm).min(COMM_MAX);
        Self {
            pid: svc.pid(),
            comm,
            comm_len,
        }
    }

    fn comm_str(&self) -> &str {
        core::str::from_utf8(&self.comm[..self.comm_len]).unwrap_or("?")
    }
}

/// A bounded path copied out of caller or host memory.
struct PathBytes {
    buf: [u8; PATH_MAX],
    len: usize,
}

impl PathBytes {
    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("<non-utf8>")
    }
}

/// Copy the pathname argument out of caller memory. None skips the
/// observation.
fn record_open(svc: &dyn HostServices, path: UserPtr) -> Option<(Ident, PathBytes)> {
    let mut buf = [0u8; PATH_MAX];
    let copied = svc.copy_from_user(&mut buf, path).ok()?;
    let len = buf[..copied].iter().position(|&b| b == 0).unwrap_or(copied);
    Some((Ident::of(svc), PathBytes { buf, len }))
}

/// Resolve the descriptor to a canonical path through the calling
/// task's descriptor table. None skips the observation.
fn record_write(svc: &dyn HostServices, fd: u32) -> Option<(Ident, PathBytes)> {
    let mut buf = [0u8; PATH_MAX];
    let len = svc.path_of(fd, &mut buf)?.min(PATH_MAX);
    Some((Ident::of(svc), PathBytes { buf, len }))
}

/// Replacement for the open entry.
///
/// # Safety
/// Must only be dispatched in place of an open entry whose original
/// has been published; arguments are forwarded untouched.
pub unsafe extern "C" fn watched_open(path: UserPtr, flags: u32, mode: u32) -> i64 {
    if let Some(svc) = services() {
        if let Some((who, name)) = record_open(svc, path) {
            info!(
                "open: {} ({}) path={} flags={:?}",
                who.comm_str(),
                who.pid,
                name.as_str(),
                OpenFlags::from_bits_truncate(flags),
            );
        }
    }

    let raw = SAVED_OPEN.load(Ordering::Acquire);
    if raw == 0 {
        return ENOSYS;
    }
    // SAFETY: The interceptor published this value out of the live
    // open slot before overriding it, so it is an entry point with
    // exactly this calling contract.
    let original: OpenFn = unsafe { core::mem::transmute(raw) };
    // SAFETY: Arguments are the caller's, unchanged.
    unsafe { original(path, flags, mode) }
}

/// Replacement for the write entry.
///
/// # Safety
/// Must only be dispatched in place of a write entry whose original
/// has been published; arguments are forwarded untouched.
pub unsafe extern "C" fn watched_write(fd: u32, buf: UserPtr, count: usize) -> i64 {
    if let Some(svc) = services() {
        if let Some((who, name)) = record_write(svc, fd) {
            info!(
                "write: {} ({}) {} bytes to {}",
                who.comm_str(),
                who.pid,
                count,
                name.as_str(),
            );
        }
    }

    let raw = SAVED_WRITE.load(Ordering::Acquire);
    if raw == 0 {
        return ENOSYS;
    }
    // SAFETY: The interceptor published this value out of the live
    // write slot before overriding it, so it is an entry point with
    // exactly this calling contract.
    let original: WriteFn = unsafe { core::mem::transmute(raw) };
    // SAFETY: Arguments are the caller's, unchanged.
    unsafe { original(fd, buf, count) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::testutil::{self, StubHost};
    use crate::usercopy::CopyError;

    /// Local mock with a caller string at one known address.
    struct Caller;

    const PATH_PTR: usize = 0x5000;

    impl UserMem for Caller {
        fn copy_from_user(&self, dst: &mut [u8], src: UserPtr) -> Result<usize, CopyError> {
            if src.as_usize() != PATH_PTR {
                return Err(CopyError::BadAddress);
            }
            let data = b"/etc/passwd\0trailing-junk";
            let n = data.len().min(dst.len());
            dst[..n].copy_from_slice(&data[..n]);
            Ok(n)
        }

        fn copy_to_user(&self, _dst: UserPtr, _src: &[u8]) -> Result<usize, CopyError> {
            Err(CopyError::BadAddress)
        }
    }

    impl TaskContext for Caller {
        fn pid(&self) -> u32 {
            1234
        }

        fn comm(&self, out: &mut [u8; COMM_MAX]) -> usize {
            out[..3].copy_from_slice(b"cat");
            3
        }
    }

    impl DescriptorPaths for Caller {
        fn path_of(&self, fd: u32, out: &mut [u8]) -> Option<usize> {
            if fd != 3 {
                return None;
            }
            let path = b"/var/log/app.log";
            out[..path.len()].copy_from_slice(path);
            Some(path.len())
        }
    }

    #[test]
    fn test_record_open_copies_bounded_path() {
        let caller = Caller;
        let (who, name) = record_open(&caller, UserPtr::new(PATH_PTR)).unwrap();
        assert_eq!(name.as_str(), "/etc/passwd");
        assert_eq!(who.pid, 1234);
        assert_eq!(who.comm_str(), "cat");
    }

    #[test]
    fn test_record_open_skipped_on_bad_pointer() {
        let caller = Caller;
        assert!(record_open(&caller, UserPtr::new(0xDEAD_0000)).is_none());
    }

    #[test]
    fn test_record_write_resolves_descriptor() {
        let caller = Caller;
        let (_, name) = record_write(&caller, 3).unwrap();
        assert_eq!(name.as_str(), "/var/log/app.log");
        assert!(record_write(&caller, 7).is_none());
    }

    #[test]
    fn test_open_flags_decode() {
        let flags = OpenFlags::from_bits_truncate(0o101);
        assert!(flags.contains(OpenFlags::WRONLY));
        assert!(flags.contains(OpenFlags::CREAT));
        assert!(!flags.contains(OpenFlags::APPEND));
    }

    // Delegation stubs with recorded arguments.

    use core::sync::atomic::{AtomicU32, AtomicUsize};

    static OPEN_PATH: AtomicUsize = AtomicUsize::new(0);
    static OPEN_FLAGS: AtomicU32 = AtomicU32::new(0);
    static OPEN_MODE: AtomicU32 = AtomicU32::new(0);

    unsafe extern "C" fn stub_open(path: UserPtr, flags: u32, mode: u32) -> i64 {
        OPEN_PATH.store(path.as_usize(), Ordering::SeqCst);
        OPEN_FLAGS.store(flags, Ordering::SeqCst);
        OPEN_MODE.store(mode, Ordering::SeqCst);
        42
    }

    static WRITE_FD: AtomicU32 = AtomicU32::new(0);
    static WRITE_BUF: AtomicUsize = AtomicUsize::new(0);
    static WRITE_COUNT: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn stub_write(fd: u32, buf: UserPtr, count: usize) -> i64 {
        WRITE_FD.store(fd, Ordering::SeqCst);
        WRITE_BUF.store(buf.as_usize(), Ordering::SeqCst);
        WRITE_COUNT.store(count, Ordering::SeqCst);
        count as i64
    }

    #[test]
    fn test_wrappers_delegate_transparently() {
        let _state = testutil::wrapper_state();
        register_services(&StubHost);

        publish_open(FnHandle::new(stub_open as OpenFn as usize));
        publish_write(FnHandle::new(stub_write as WriteFn as usize));

        // Observable path: the stub host recognizes this pointer.
        let ret = unsafe { watched_open(UserPtr::new(testutil::STUB_PATH_PTR), 0o101, 0o644) };
        assert_eq!(ret, 42);
        assert_eq!(OPEN_PATH.load(Ordering::SeqCst), testutil::STUB_PATH_PTR);
        assert_eq!(OPEN_FLAGS.load(Ordering::SeqCst), 0o101);
        assert_eq!(OPEN_MODE.load(Ordering::SeqCst), 0o644);

        // Unreadable caller pointer: observation skipped, call still
        // delegated with the pointer unchanged.
        let ret = unsafe { watched_open(UserPtr::new(0xDEAD_0000), 0, 0) };
        assert_eq!(ret, 42);
        assert_eq!(OPEN_PATH.load(Ordering::SeqCst), 0xDEAD_0000);

        let ret = unsafe { watched_write(9, UserPtr::new(0x7700), 512) };
        assert_eq!(ret, 512);
        assert_eq!(WRITE_FD.load(Ordering::SeqCst), 9);
        assert_eq!(WRITE_BUF.load(Ordering::SeqCst), 0x7700);
        assert_eq!(WRITE_COUNT.load(Ordering::SeqCst), 512);

        // After retraction there is nothing to delegate to.
        retract_originals();
        let ret = unsafe { watched_open(UserPtr::new(testutil::STUB_PATH_PTR), 0, 0) };
        assert_eq!(ret, ENOSYS);
        let ret = unsafe { watched_write(9, UserPtr::new(0x7700), 1) };
        assert_eq!(ret, ENOSYS);
    }
}
