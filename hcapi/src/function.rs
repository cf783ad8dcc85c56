use bitflags::bitflags;

use crate::UInt3;

/// Entry-point kind as reported by the function-info side channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionType {
    Kernel,
    Vertex,
    Fragment,
    TessellationControl,
    TessellationEvaluation,
    /// Not a function: describes the internal layout of an argument buffer.
    ArgumentBufferStruct,
}

impl FunctionType {
    /// Numeric tag used in the function-info file.
    pub fn from_token(token: &str) -> Option<FunctionType> {
        match token {
            "1" => Some(FunctionType::Kernel),
            "2" => Some(FunctionType::Vertex),
            "3" => Some(FunctionType::Fragment),
            "4" => Some(FunctionType::TessellationControl),
            "5" => Some(FunctionType::TessellationEvaluation),
            "100" => Some(FunctionType::ArgumentBufferStruct),
            _ => None,
        }
    }
}

bitflags! {
    /// Per-function flag bits. Unknown bits are retained verbatim.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FunctionFlags: u64 {
        const USES_SOFT_PRINTF = 1 << 0;
        const _ = !0;
    }
}

bitflags! {
    /// Per-argument flag bits. Unknown bits are retained verbatim.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ArgFlags: u64 {
        /// The argument is an argument buffer and carries nested layout info.
        const ARGUMENT_BUFFER = 1 << 0;
        const _ = !0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArgAddressSpace {
    #[default]
    Unknown,
    Global,
    Local,
    Constant,
    Image,
}

impl ArgAddressSpace {
    pub const fn from_raw(v: u64) -> ArgAddressSpace {
        match v {
            1 => ArgAddressSpace::Global,
            2 => ArgAddressSpace::Local,
            3 => ArgAddressSpace::Constant,
            4 => ArgAddressSpace::Image,
            _ => ArgAddressSpace::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArgAccess {
    #[default]
    Unspecified,
    Read,
    Write,
    ReadWrite,
}

impl ArgAccess {
    pub const fn from_raw(v: u64) -> ArgAccess {
        match v {
            1 => ArgAccess::Read,
            2 => ArgAccess::Write,
            3 => ArgAccess::ReadWrite,
            _ => ArgAccess::Unspecified,
        }
    }
}

/// Raw image-type tag; interpreted by the backend image layer, opaque here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArgImageType(pub u32);

impl ArgImageType {
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

/// Shape of one kernel argument.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArgInfo {
    pub size: u64,
    pub array_extent: u64,
    pub address_space: ArgAddressSpace,
    pub access: ArgAccess,
    pub image_type: ArgImageType,
    pub flags: ArgFlags,
    /// Layout of the argument buffer, present iff `flags` carries
    /// `ARGUMENT_BUFFER` (enforced by the function-info parser).
    pub argument_buffer_info: Option<Box<FunctionInfo>>,
}

/// Per-kernel metadata from the compiler side channel.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInfo {
    pub name: String,
    pub func_type: FunctionType,
    pub flags: FunctionFlags,
    /// Zero vector means the kernel accepts any local size.
    pub required_local_size: UInt3,
    /// Zero means the kernel accepts any SIMD width.
    pub required_simd_width: u32,
    pub args: Vec<ArgInfo>,
}

impl FunctionInfo {
    /// Whether `local` satisfies the kernel's required local size.
    pub fn allows_local_size(&self, local: &UInt3) -> bool {
        self.required_local_size.is_zero() || self.required_local_size == *local
    }
}
