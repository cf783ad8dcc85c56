use bitflags::bitflags;

use crate::UInt3;

/// Hardware vendor, also used for the platform (driver) vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Vendor {
    Nvidia,
    Intel,
    Amd,
    Apple,
    Arm,
    Qualcomm,
    #[default]
    Unknown,
}

impl Vendor {
    /// Upper-case spelling used in the device define vocabulary.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Vendor::Nvidia => "NVIDIA",
            Vendor::Intel => "INTEL",
            Vendor::Amd => "AMD",
            Vendor::Apple => "APPLE",
            Vendor::Arm => "ARM",
            Vendor::Qualcomm => "QUALCOMM",
            Vendor::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceType {
    Gpu,
    Cpu,
    #[default]
    Unknown,
}

impl DeviceType {
    pub const fn is_gpu(&self) -> bool {
        matches!(self, DeviceType::Gpu)
    }

    pub const fn is_cpu(&self) -> bool {
        matches!(self, DeviceType::Cpu)
    }
}

/// Host OS as seen by the generated device code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    Macos,
    Ios,
    Visionos,
    Windows,
    Freebsd,
    Openbsd,
    Unknown,
}

impl Os {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Os::Linux => "LINUX",
            Os::Macos => "OSX",
            Os::Ios => "IOS",
            Os::Visionos => "VISIONOS",
            Os::Windows => "WINDOWS",
            Os::Freebsd => "FREEBSD",
            Os::Openbsd => "OPENBSD",
            Os::Unknown => "UNKNOWN",
        }
    }

    /// The OS this process was built for.
    pub const fn current() -> Os {
        #[cfg(target_os = "linux")]
        { Os::Linux }
        #[cfg(target_os = "macos")]
        { Os::Macos }
        #[cfg(target_os = "ios")]
        { Os::Ios }
        #[cfg(target_os = "windows")]
        { Os::Windows }
        #[cfg(target_os = "freebsd")]
        { Os::Freebsd }
        #[cfg(target_os = "openbsd")]
        { Os::Openbsd }
        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios",
                      target_os = "windows", target_os = "freebsd", target_os = "openbsd")))]
        { Os::Unknown }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OpenClVersion {
    Cl10,
    Cl11,
    Cl12,
    Cl20,
    Cl21,
    Cl22,
    Cl30,
}

impl OpenClVersion {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OpenClVersion::Cl10 => "1.0",
            OpenClVersion::Cl11 => "1.1",
            OpenClVersion::Cl12 => "1.2",
            OpenClVersion::Cl20 => "2.0",
            OpenClVersion::Cl21 => "2.1",
            OpenClVersion::Cl22 => "2.2",
            OpenClVersion::Cl30 => "3.0",
        }
    }

    pub const fn major(&self) -> u32 {
        match self {
            OpenClVersion::Cl10 | OpenClVersion::Cl11 | OpenClVersion::Cl12 => 1,
            OpenClVersion::Cl20 | OpenClVersion::Cl21 | OpenClVersion::Cl22 => 2,
            OpenClVersion::Cl30 => 3,
        }
    }

    pub const fn minor(&self) -> u32 {
        match self {
            OpenClVersion::Cl10 | OpenClVersion::Cl20 | OpenClVersion::Cl30 => 0,
            OpenClVersion::Cl11 | OpenClVersion::Cl21 => 1,
            OpenClVersion::Cl12 | OpenClVersion::Cl22 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SpirvVersion {
    V1_0,
    V1_3,
    V1_4,
    V1_5,
    V1_6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MetalVersion {
    Metal3_0,
    Metal3_1,
    Metal3_2,
    Metal4_0,
}

impl MetalVersion {
    pub const fn std_name(&self) -> &'static str {
        match self {
            MetalVersion::Metal3_0 => "metal3.0",
            MetalVersion::Metal3_1 => "metal3.1",
            MetalVersion::Metal3_2 => "metal3.2",
            MetalVersion::Metal4_0 => "metal4.0",
        }
    }

    pub const fn major(&self) -> u32 {
        match self {
            MetalVersion::Metal4_0 => 4,
            _ => 3,
        }
    }

    pub const fn minor(&self) -> u32 {
        match self {
            MetalVersion::Metal3_0 | MetalVersion::Metal4_0 => 0,
            MetalVersion::Metal3_1 => 1,
            MetalVersion::Metal3_2 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetalPlatform {
    Macos,
    Ios,
    IosSimulator,
    Visionos,
    VisionosSimulator,
}

impl MetalPlatform {
    pub const fn is_simulator(&self) -> bool {
        matches!(self, MetalPlatform::IosSimulator | MetalPlatform::VisionosSimulator)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetalFamily {
    Apple,
    Mac,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VulkanVersion {
    Vulkan1_3,
    Vulkan1_4,
}

impl VulkanVersion {
    pub const fn std_name(&self) -> &'static str {
        match self {
            VulkanVersion::Vulkan1_3 => "vulkan1.3",
            VulkanVersion::Vulkan1_4 => "vulkan1.4",
        }
    }
}

/// CPU micro-architecture tier of the Host-Compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HostCpuTier {
    X86Tier1,
    X86Tier2,
    X86Tier3,
    X86Tier4,
    X86Tier5,
    ArmTier1,
    ArmTier2,
    ArmTier3,
    ArmTier4,
    ArmTier5,
    ArmTier6,
    ArmTier7,
}

impl HostCpuTier {
    pub const fn is_x86(&self) -> bool {
        matches!(self, HostCpuTier::X86Tier1 | HostCpuTier::X86Tier2 | HostCpuTier::X86Tier3
                     | HostCpuTier::X86Tier4 | HostCpuTier::X86Tier5)
    }

    pub const fn target_arch(&self) -> &'static str {
        if self.is_x86() { "x86_64" } else { "aarch64" }
    }

    /// `-march=` value for this tier.
    pub const fn march(&self) -> &'static str {
        match self {
            HostCpuTier::X86Tier1 => "corei7",
            HostCpuTier::X86Tier2 => "corei7-avx",
            HostCpuTier::X86Tier3 => "core-avx2",
            HostCpuTier::X86Tier4 => "skylake-avx512",
            HostCpuTier::X86Tier5 => {
                "x86-64-v4 -mavx512ifma -mavx512vbmi -mavx512vbmi2 -mvaes -mavx512bitalg \
                 -mvpclmulqdq -mgfni -mavx512vnni -mavx512vpopcntdq -mavx512bf16"
            }
            HostCpuTier::ArmTier1 => "armv8-a",
            HostCpuTier::ArmTier2 => "armv8.1-a+fp16",
            HostCpuTier::ArmTier3 => "armv8.2-a+fp16",
            HostCpuTier::ArmTier4 => "armv8.3-a+fp16",
            HostCpuTier::ArmTier5 => "armv8.4-a+fp16",
            HostCpuTier::ArmTier6 => "armv8.5-a+fp16+fp16fml",
            HostCpuTier::ArmTier7 => "armv8.6-a+fp16+fp16fml",
        }
    }

    pub const fn mtune(&self) -> Option<&'static str> {
        match self {
            HostCpuTier::X86Tier5 => Some("znver3"),
            _ => None,
        }
    }

    /// Tiers that should override the default preference for 256-bit vectors.
    pub const fn prefer_vector_width(&self) -> Option<&'static str> {
        match self {
            HostCpuTier::X86Tier4 | HostCpuTier::X86Tier5 => Some("512"),
            _ => None,
        }
    }
}

/// Backend-specific part of a device description.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendInfo {
    OpenCl {
        cl_version: OpenClVersion,
        spirv_version: Option<SpirvVersion>,
    },
    Cuda {
        /// (major, minor) streaming-multiprocessor version, e.g. (8, 6).
        sm: (u32, u32),
        /// Architecture-accelerated codegen (sm_90a and friends).
        sm_aa: bool,
    },
    Metal {
        platform: MetalPlatform,
        family: MetalFamily,
        language_version: MetalVersion,
        simd_reduction: bool,
    },
    Vulkan {
        version: VulkanVersion,
        float16_support: bool,
        max_inline_uniform_block_size: u32,
        max_inline_uniform_block_count: u32,
        subgroup_uniform_cf_support: bool,
        max_descriptor_set_count: u32,
    },
    Host {
        cpu_tier: HostCpuTier,
    },
}

/// Backend-neutral device description.
///
/// This is the input contract of the compile driver: everything the driver
/// bakes into the device define vocabulary comes from here. Backend drivers
/// fill one of these during device enumeration.
#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub vendor: Vendor,
    pub platform_vendor: Vendor,
    pub device_type: DeviceType,
    /// Compute units; for the Host-Compute device this is the logical CPU count.
    pub units: u32,

    pub double_support: bool,
    pub fma_support: bool,
    pub basic_64_bit_atomics_support: bool,
    pub extended_64_bit_atomics_support: bool,
    pub basic_32_bit_float_atomics_support: bool,
    pub local_mem_dedicated: bool,
    pub local_mem_size: u64,
    pub primitive_id_support: bool,
    pub barycentric_coord_support: bool,
    pub sub_group_support: bool,
    pub sub_group_shuffle_support: bool,
    pub cooperative_kernel_support: bool,

    pub image_support: bool,
    pub image_depth_support: bool,
    pub image_depth_write_support: bool,
    pub image_msaa_support: bool,
    pub image_msaa_write_support: bool,
    pub image_msaa_array_support: bool,
    pub image_msaa_array_write_support: bool,
    pub image_cube_support: bool,
    pub image_cube_write_support: bool,
    pub image_cube_array_support: bool,
    pub image_cube_array_write_support: bool,
    pub image_mipmap_support: bool,
    pub image_mipmap_write_support: bool,
    pub image_offset_read_support: bool,
    pub image_offset_write_support: bool,
    pub image_depth_compare_support: bool,
    pub image_gather_support: bool,
    pub image_read_write_support: bool,
    pub max_mip_levels: u32,

    pub indirect_command_support: bool,
    pub indirect_compute_command_support: bool,
    pub indirect_render_command_support: bool,
    pub tessellation_support: bool,
    pub max_tessellation_factor: u32,
    pub argument_buffer_support: bool,
    pub argument_buffer_image_support: bool,
    pub param_workaround: bool,

    pub max_global_size: [u64; 3],
    pub max_group_size: UInt3,
    pub max_total_local_size: u32,
    pub simd_width: u32,
    /// (min, max) SIMD width range.
    pub simd_range: (u32, u32),

    pub backend: BackendInfo,
}

impl Device {
    pub const fn max_global_size_element(&self) -> u64 {
        let xy = if self.max_global_size[0] > self.max_global_size[1] {
            self.max_global_size[0]
        } else {
            self.max_global_size[1]
        };
        if xy > self.max_global_size[2] { xy } else { self.max_global_size[2] }
    }
}

bitflags! {
    /// Image capability bitset passed to the compiler as one value.
    ///
    /// Bit order is ABI between the driver and the device headers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ImageCapability: u32 {
        const BASIC = 1 << 0;
        const DEPTH_READ = 1 << 1;
        const DEPTH_WRITE = 1 << 2;
        const MSAA_READ = 1 << 3;
        const MSAA_WRITE = 1 << 4;
        const MSAA_ARRAY_READ = 1 << 5;
        const MSAA_ARRAY_WRITE = 1 << 6;
        const CUBE_READ = 1 << 7;
        const CUBE_WRITE = 1 << 8;
        const CUBE_ARRAY_READ = 1 << 9;
        const CUBE_ARRAY_WRITE = 1 << 10;
        const MIPMAP_READ = 1 << 11;
        const MIPMAP_WRITE = 1 << 12;
        const OFFSET_READ = 1 << 13;
        const OFFSET_WRITE = 1 << 14;
        const DEPTH_COMPARE = 1 << 15;
        const GATHER = 1 << 16;
        const READ_WRITE = 1 << 17;
    }
}

impl ImageCapability {
    pub fn from_device(dev: &Device) -> Self {
        let mut caps = ImageCapability::empty();
        let mut set = |cond: bool, cap: ImageCapability| {
            if cond {
                caps |= cap;
            }
        };
        set(dev.image_support, ImageCapability::BASIC);
        set(dev.image_depth_support, ImageCapability::DEPTH_READ);
        set(dev.image_depth_write_support, ImageCapability::DEPTH_WRITE);
        set(dev.image_msaa_support, ImageCapability::MSAA_READ);
        set(dev.image_msaa_write_support, ImageCapability::MSAA_WRITE);
        set(dev.image_msaa_array_support, ImageCapability::MSAA_ARRAY_READ);
        set(dev.image_msaa_array_write_support, ImageCapability::MSAA_ARRAY_WRITE);
        set(dev.image_cube_support, ImageCapability::CUBE_READ);
        set(dev.image_cube_write_support, ImageCapability::CUBE_WRITE);
        set(dev.image_cube_array_support, ImageCapability::CUBE_ARRAY_READ);
        set(dev.image_cube_array_write_support, ImageCapability::CUBE_ARRAY_WRITE);
        set(dev.image_mipmap_support, ImageCapability::MIPMAP_READ);
        set(dev.image_mipmap_write_support, ImageCapability::MIPMAP_WRITE);
        set(dev.image_offset_read_support, ImageCapability::OFFSET_READ);
        set(dev.image_offset_write_support, ImageCapability::OFFSET_WRITE);
        set(dev.image_depth_compare_support, ImageCapability::DEPTH_COMPARE);
        set(dev.image_gather_support, ImageCapability::GATHER);
        set(dev.image_read_write_support, ImageCapability::READ_WRITE);
        caps
    }
}

impl Default for Device {
    fn default() -> Self {
        Device {
            name: String::new(),
            vendor: Vendor::Unknown,
            platform_vendor: Vendor::Unknown,
            device_type: DeviceType::Unknown,
            units: 0,
            double_support: false,
            fma_support: false,
            basic_64_bit_atomics_support: false,
            extended_64_bit_atomics_support: false,
            basic_32_bit_float_atomics_support: false,
            local_mem_dedicated: false,
            local_mem_size: 0,
            primitive_id_support: false,
            barycentric_coord_support: false,
            sub_group_support: false,
            sub_group_shuffle_support: false,
            cooperative_kernel_support: false,
            image_support: false,
            image_depth_support: false,
            image_depth_write_support: false,
            image_msaa_support: false,
            image_msaa_write_support: false,
            image_msaa_array_support: false,
            image_msaa_array_write_support: false,
            image_cube_support: false,
            image_cube_write_support: false,
            image_cube_array_support: false,
            image_cube_array_write_support: false,
            image_mipmap_support: false,
            image_mipmap_write_support: false,
            image_offset_read_support: false,
            image_offset_write_support: false,
            image_depth_compare_support: false,
            image_gather_support: false,
            image_read_write_support: false,
            max_mip_levels: 0,
            indirect_command_support: false,
            indirect_compute_command_support: false,
            indirect_render_command_support: false,
            tessellation_support: false,
            max_tessellation_factor: 0,
            argument_buffer_support: false,
            argument_buffer_image_support: false,
            param_workaround: false,
            max_global_size: [0; 3],
            max_group_size: UInt3::zero(),
            max_total_local_size: 0,
            simd_width: 0,
            simd_range: (1, 1),
            backend: BackendInfo::Host { cpu_tier: HostCpuTier::X86Tier1 },
        }
    }
}
