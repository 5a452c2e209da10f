//! Single-Client Random-Value Device
//!
//! A pseudo-device that hands a fixed-size random value to exactly one
//! client at a time. Access is gated by a fail-fast lock: a second
//! open while the device is held is told "busy" immediately, never
//! queued.
//!
//! # Lifecycle
//! - `open` acquires the gate and returns a [`Client`]
//! - `Client::read` draws a value and delivers it into caller memory
//! - release happens on drop, so it runs exactly once per successful
//!   open, including when the holding client dies abnormally

use log::{debug, warn};
use spin::Mutex;

use crate::security::Zeroize;
use crate::sync::TryLock;
use crate::usercopy::{UserMem, UserPtr};

/// Size of the value delivered per read.
pub const VALUE_LEN: usize = 4;

/// Source of cryptographically-sourced random bytes.
///
/// `HwRandom` is the hardware-backed production implementation; tests
/// substitute a fixed sequence.
pub trait EntropySource {
    /// Fill `buf` with random bytes.
    fn fill(&mut self, buf: &mut [u8]);
}

/// Hardware entropy via the ARM64 `RNDR` register.
///
/// Each read draws a fresh 64-bit value from the core's TRNG-reseeded
/// DRBG. Reads that cannot complete in time are retried; the register
/// signals an invalid draw through the condition flags.
#[cfg(target_arch = "aarch64")]
pub struct HwRandom {
    _private: (),
}

#[cfg(target_arch = "aarch64")]
impl HwRandom {
    /// Create the hardware entropy source.
    ///
    /// # Safety
    /// The executing core must implement FEAT_RNG
    /// (`ID_AA64ISAR0_EL1.RNDR != 0`); the register encoding is
    /// undefined otherwise.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }

    fn draw() -> u64 {
        let value: u64;
        // SAFETY: Construction asserts FEAT_RNG. RNDR has no side
        // effects beyond the condition flags; a failed draw sets Z and
        // is retried.
        unsafe {
            core::arch::asm!(
                "2:",
                "mrs {value}, s3_3_c2_c4_0", // RNDR
                "b.eq 2b",
                value = out(reg) value,
                options(nomem, nostack),
            );
        }
        value
    }
}

#[cfg(target_arch = "aarch64")]
impl EntropySource for HwRandom {
    fn fill(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(8) {
            let bytes = Self::draw().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}

/// Error type for device opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenError {
    /// Another client holds the device.
    Busy,
}

impl core::fmt::Display for OpenError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Busy => write!(f, "device held by another client"),
        }
    }
}

/// Error type for device reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// The value could not be delivered into caller memory.
    Delivery,
}

impl core::fmt::Display for ReadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Delivery => write!(f, "value could not be delivered"),
        }
    }
}

/// The random-value device.
#[derive(Debug)]
pub struct RandChar<E: EntropySource> {
    gate: TryLock,
    entropy: Mutex<E>,
}

impl<E: EntropySource> RandChar<E> {
    /// Create the device over an entropy source.
    pub const fn new(entropy: E) -> Self {
        Self {
            gate: TryLock::new(),
            entropy: Mutex::new(entropy),
        }
    }

    /// Acquire exclusive access.
    ///
    /// Fails fast with [`OpenError::Busy`] while another client holds
    /// the device; there is no queue.
    pub fn open(&self) -> Result<Client<'_, E>, OpenError> {
        if !self.gate.try_acquire() {
            debug!("randchar: open rejected, device busy");
            return Err(OpenError::Busy);
        }
        debug!("randchar: opened");
        Ok(Client { dev: self })
    }
}

/// Exclusive handle to the device between open and release.
///
/// Reads are only possible through this handle, which makes "operate
/// only between acquire and release" a type-level fact.
#[derive(Debug)]
pub struct Client<'a, E: EntropySource> {
    dev: &'a RandChar<E>,
}

impl<E: EntropySource> Client<'_, E> {
    /// Draw a random value and deliver it to caller memory at `dst`.
    ///
    /// At most [`VALUE_LEN`] bytes are delivered, capped by `len`.
    /// Returns the number of bytes actually delivered; a failed copy
    /// is reported as [`ReadError::Delivery`], never silently dropped.
    pub fn read(&mut self, mem: &dyn UserMem, dst: UserPtr, len: usize) -> Result<usize, ReadError> {
        let mut value = [0u8; VALUE_LEN];
        let n = VALUE_LEN.min(len);

        self.dev.entropy.lock().fill(&mut value);
        let result = mem.copy_to_user(dst, &value[..n]);
        // The value belongs to the client now; keep no copy.
        value.zeroize();

        match result {
            Ok(delivered) => {
                debug!("randchar: delivered {} bytes", delivered);
                Ok(delivered)
            }
            Err(e) => {
                warn!("randchar: delivery failed: {}", e);
                Err(ReadError::Delivery)
            }
        }
    }
}

impl<E: EntropySource> Drop for Client<'_, E> {
    fn drop(&mut self) {
        self.dev.gate.release();
        debug!("randchar: released");
    }
}
