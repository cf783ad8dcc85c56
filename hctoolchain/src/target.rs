use std::ffi::CString;
use std::path::PathBuf;

use hcapi::FunctionInfo;

/// Compilation target, one per supported backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// OpenCL SPIR 1.2 LLVM bitcode.
    Spir,
    /// Metal AIR metallib.
    Air,
    /// CUDA PTX text.
    Ptx,
    /// Vulkan SPIR-V container.
    SpirvVulkan,
    /// OpenCL SPIR-V module.
    SpirvOpencl,
    /// Host-Compute relocatable ELF object.
    HostCompute,
}

impl Target {
    pub const ALL: [Target; 6] = [
        Target::Spir,
        Target::Air,
        Target::Ptx,
        Target::SpirvVulkan,
        Target::SpirvOpencl,
        Target::HostCompute,
    ];
}

#[derive(Debug, Clone, Default)]
pub struct DebugOptions {
    /// Emit line-table debug info even when the toolchain-wide debug flag is
    /// off.
    pub emit_debug_info: bool,
    /// Metal only: split the build into preprocess + compile so the
    /// (condensed) source survives into the debug info.
    pub preprocess_condense: bool,
    pub preprocess_preserve_comments: bool,
}

#[derive(Debug, Clone)]
pub struct CudaOptions {
    /// Minimum PTX ISA version; raised further by the device's sm tier.
    pub ptx_version: u32,
    /// 32-bit buffer pointers.
    pub short_ptr: bool,
}

impl Default for CudaOptions {
    fn default() -> Self {
        CudaOptions { ptx_version: 80, short_ptr: false }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetalOptions {
    /// Override of the toolchain-wide soft-printf default.
    pub soft_printf: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct VulkanOptions {
    pub soft_printf: Option<bool>,
    /// Run spirv-opt over the produced module.
    pub run_opt: bool,
    /// Replaces the default spirv-opt pipeline when set.
    pub opt_overrides: Option<String>,
    pub pre_structurization_pass: bool,
}

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub target: Target,
    /// Extra command-line options appended verbatim.
    pub cli: String,
    pub enable_warnings: bool,
    pub enable_assert: bool,
    /// Compile for the device description as-is, without consulting any
    /// runtime/host state (forced versions, host CPU feature probing, OS
    /// version). Used for offline/cross compilation.
    pub ignore_runtime_info: bool,
    pub silence_debug_output: bool,
    /// Precompiled header to consume (or the output name when building one).
    pub pch: Option<PathBuf>,
    pub debug: DebugOptions,
    pub cuda: CudaOptions,
    pub metal: MetalOptions,
    pub vulkan: VulkanOptions,
}

impl CompileOptions {
    pub fn new(target: Target) -> CompileOptions {
        CompileOptions {
            target,
            cli: String::new(),
            enable_warnings: false,
            enable_assert: false,
            ignore_runtime_info: false,
            silence_debug_output: false,
            pch: None,
            debug: DebugOptions::default(),
            cuda: CudaOptions::default(),
            metal: MetalOptions::default(),
            vulkan: VulkanOptions::default(),
        }
    }
}

/// The produced artifact, by target convention.
#[derive(Debug)]
pub enum ProgramOutput {
    /// In-memory binary module (SPIR bitcode).
    Bytes(Vec<u8>),
    /// NUL-terminated text module (PTX).
    Text(CString),
    /// On-disk artifact consumed by the backend driver (AIR metallib, SPIR-V
    /// module, Host-Compute ELF object, PCH).
    File(PathBuf),
}

/// Result of a successful program build.
#[derive(Debug)]
pub struct ProgramData {
    pub output: ProgramOutput,
    pub functions: Vec<FunctionInfo>,
    pub options: CompileOptions,
}
