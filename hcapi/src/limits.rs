//! Fixed limits of the Host-Compute CPU device.
//!
//! These are compile-time constants shared between the loader, the executor
//! and the compile driver (which bakes them into the device defines).

/// Fixed SIMD/sub-group width of the CPU device.
pub const SIMD_WIDTH: u32 = 16;

/// Maximum number of work-items in one work-group.
pub const MAX_TOTAL_LOCAL_SIZE: u32 = 1024;

/// Per-CPU "local memory" arena size.
pub const LOCAL_MEMORY_SIZE: usize = 64 * 1024;

/// Size of one fiber stack. Stacks are aligned to this value, which is what
/// makes the stack-pointer-rounding context lookup possible.
pub const FIBER_STACK_SIZE: usize = 16 * 1024;

/// Total size of the process-wide printf ring buffer, header included.
pub const PRINTF_BUFFER_SIZE: u32 = 1024 * 1024;

/// Two u32 header words: current write offset and total size.
pub const PRINTF_BUFFER_HEADER_SIZE: u32 = 8;
