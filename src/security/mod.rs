//! Security Primitives Module
//!
//! # Security Properties
//! - Secrets are always zeroed when no longer needed
//! - Memory is cleared using volatile writes to prevent optimization

pub mod zeroize;

pub use zeroize::Zeroize;
