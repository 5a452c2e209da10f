//! grapnel - Runtime Syscall-Table Interposition
//!
//! Locates a live dispatch table by matching a known entry, swaps
//! selected entries for observing wrappers inside a narrow
//! page-unprotect window, and restores the originals exactly on
//! teardown. A single-client random-value device ships alongside,
//! built on the same controlled-lifecycle discipline.
//!
//! # Components
//! - `mm`: typed addresses, page-table descriptors, protection toggle
//! - `hook`: table locator, interceptor state machine, open/write
//!   wrappers, lifecycle facade
//! - `drivers`: the random-value device
//! - `sync`, `usercopy`, `task`, `security`: narrow host interfaces
//!   and supporting primitives
//!
//! # Security Posture
//! - The dispatch table is writable only inside install/uninstall
//! - A failed installation leaves no side effects
//! - Wrapper observation is best-effort and never affects the
//!   underlying operation
//! - The device gate is released exactly once per acquire, on drop

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod drivers;
pub mod hook;
pub mod mm;
pub mod security;
pub mod sync;
pub mod task;
pub mod usercopy;

pub use hook::{FileHooks, FnHandle, Interceptor, KnownSlot, ScanRange};
pub use mm::{PageProtection, VirtAddr};
