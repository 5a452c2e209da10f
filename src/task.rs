//! Calling-Task Identity and Descriptor Resolution
//!
//! Narrow views of the host's task and open-descriptor state, consumed
//! when attributing an intercepted call to the task that made it.

/// Maximum length of a task command name, including no terminator.
pub const COMM_MAX: usize = 16;

/// Identity of the task currently executing.
///
/// The host resolves "current" on every call; implementations must be
/// callable from arbitrary task contexts.
pub trait TaskContext {
    /// Process id of the calling task.
    fn pid(&self) -> u32;

    /// Write the calling task's command name into `out` and return the
    /// number of bytes written (at most [`COMM_MAX`]).
    fn comm(&self, out: &mut [u8; COMM_MAX]) -> usize;
}

/// Resolution of descriptors through the calling task's open-resource
/// table.
pub trait DescriptorPaths {
    /// Write the canonical path for descriptor `fd` of the calling
    /// task into `out` and return the number of bytes written, or
    /// `None` if the descriptor is not open or has no path.
    fn path_of(&self, fd: u32, out: &mut [u8]) -> Option<usize>;
}
