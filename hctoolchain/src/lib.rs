//! Backend-neutral kernel compile driver.
//!
//! One clang invocation per build: the driver picks the vendored toolchain
//! for the target, frames the language/target options, bakes the device
//! capabilities into a dense define vocabulary, collects the function-info
//! side channel and post-processes the output into the target's binary form
//! (SPIR bitcode, SPIR-V, PTX, AIR metallib or a Host-Compute ELF object).

mod defines;
mod driver;
mod function_info;
mod target;

pub use driver::{SpirvTools, ToolPaths, Toolchain};
pub use function_info::{parse_function_info, parse_function_info_file};
pub use target::{
    CompileOptions, CudaOptions, DebugOptions, MetalOptions, ProgramData, ProgramOutput, Target,
    VulkanOptions,
};

use thiserror::Error;

pub type Result<T> = core::result::Result<T, ToolchainError>;

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("can not compile {0} source code without a toolchain")]
    MissingToolchain(&'static str),
    #[error("device is not a {0} device")]
    DeviceMismatch(&'static str),
    #[error("compilation failed")]
    Compilation,
    #[error("invalid function info: {0}")]
    FunctionInfo(String),
    #[error("unsupported configuration: {0}")]
    Unsupported(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
