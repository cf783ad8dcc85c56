//! Work-group execution engine for the Host-Compute CPU device.
//!
//! Work-items are cooperative user-space fibers: one OS worker thread per
//! participating CPU runs a whole work-group as a fiber pool, with barriers
//! and SIMD group operations implemented as context swaps inside the pool.
//! The dispatcher marshals kernel arguments, partitions the global range into
//! work-groups and hands out group ids through an atomic ticket counter.

mod buffer;
mod dispatch;
pub mod exec;
pub mod fiber;
mod printf;
mod runtime;

pub use buffer::HostBuffer;
pub use dispatch::{HostKernel, KernelArg};
pub use runtime::{ExecSymbols, HostRuntime};

use thiserror::Error;

pub type Result<T> = core::result::Result<T, ExecError>;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("cooperative kernel execution is not supported for Host-Compute")]
    Cooperative,
    #[error("invalid work geometry: {0}")]
    Geometry(String),
    #[error("too many function parameters specified (only up to 32 parameters are supported)")]
    TooManyArgs,
    #[error("no instance for CPU #{0}")]
    MissingInstance(u32),
    #[error("failed to find function \"{0}\"")]
    MissingFunction(String),
    #[error("runtime initialisation failed: {0}")]
    Runtime(String),
    #[error("exceeded local memory allocation in function \"{0}\"")]
    LocalMemoryExceeded(String),
    #[error("barrier misuse detected in function \"{0}\"")]
    BarrierMisuse(String),
}
