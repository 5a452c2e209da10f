//! Secure Memory Zeroization
//!
//! Implements secure zeroization of sensitive data to prevent secrets
//! remaining in freed or reused memory.
//!
//! # Design
//! - `Zeroize` trait for types that can be securely cleared
//! - Volatile writes prevent compiler optimization of zeroing

use core::ptr;
use core::sync::atomic::{compiler_fence, Ordering};

/// Trait for types that can be securely zeroed.
///
/// Implementations must ensure that all secret data is overwritten
/// with zeros in a way that cannot be optimized away.
pub trait Zeroize {
    /// Overwrite this value with zeros.
    ///
    /// This operation is guaranteed to not be optimized away.
    fn zeroize(&mut self);
}

/// Zeroize implementation for byte slices.
impl Zeroize for [u8] {
    fn zeroize(&mut self) {
        // SAFETY: We have a valid mutable reference to the slice
        unsafe {
            volatile_set_memory(self.as_mut_ptr(), 0, self.len());
        }
        compiler_fence(Ordering::SeqCst);
    }
}

/// Zeroize implementation for fixed-size byte arrays.
impl<const N: usize> Zeroize for [u8; N] {
    fn zeroize(&mut self) {
        self.as_mut_slice().zeroize();
    }
}

/// Volatile memset that cannot be optimized away.
///
/// # Safety
/// - `dst` must be valid for writes of `count` bytes
/// - `dst` must be properly aligned
#[inline]
unsafe fn volatile_set_memory(dst: *mut u8, val: u8, count: usize) {
    for i in 0..count {
        // SAFETY: Caller guarantees dst is valid for count bytes
        unsafe {
            ptr::write_volatile(dst.add(i), val);
        }
    }
}
