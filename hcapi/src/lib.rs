//! Shared API types for the heterogeneous compute runtime.
//!
//! Everything in here is plain data: the device description consumed by the
//! compile driver, the per-work-item id block shared with device binaries,
//! and the per-kernel metadata produced by the function-info side channel.

mod device;
mod function;
mod ids;
pub mod limits;
mod vec;

pub use device::{
    BackendInfo, Device, DeviceType, HostCpuTier, ImageCapability, MetalFamily, MetalPlatform,
    MetalVersion, OpenClVersion, Os, SpirvVersion, Vendor, VulkanVersion,
};
pub use function::{
    ArgAccess, ArgAddressSpace, ArgFlags, ArgImageType, ArgInfo, FunctionFlags, FunctionInfo,
    FunctionType,
};
pub use ids::KernelIds;
pub use vec::UInt3;
