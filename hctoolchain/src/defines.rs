//! Device capability define vocabulary.
//!
//! Every device property is baked into the compile command as a preprocessor
//! macro. For boolean properties both a valued macro (`...=1`) and a naked
//! marker (`..._1`) are emitted, so the device headers can use them in enum
//! initialisers as well as in `#ifdef` position. The define list is an ABI
//! between this driver and the generated device headers; adding or removing
//! a define breaks the headers.

use std::fmt::Write;

use hcapi::{Device, ImageCapability, Os, Vendor};

use crate::target::CompileOptions;

pub(crate) struct DefineWriter<'a> {
    cmd: &'a mut String,
}

impl<'a> DefineWriter<'a> {
    pub(crate) fn new(cmd: &'a mut String) -> DefineWriter<'a> {
        DefineWriter { cmd }
    }

    /// `-DHC_DEVICE_INFO_<name>=<value>` plus `-DHC_DEVICE_INFO_<name>_<value>`.
    fn info(&mut self, name: &str, value: impl std::fmt::Display) {
        write!(self.cmd, " -DHC_DEVICE_INFO_{name}={value} -DHC_DEVICE_INFO_{name}_{value}")
            .expect("writing to a String");
    }

    /// `-DHC_DEVICE_INFO_<name>=<value>u` (numeric, no marker define).
    fn info_u32(&mut self, name: &str, value: u32) {
        write!(self.cmd, " -DHC_DEVICE_INFO_{name}={value}u").expect("writing to a String");
    }

    fn flag(&mut self, text: &str) {
        self.cmd.push(' ');
        self.cmd.push_str(text);
    }
}

fn bool_str(v: bool) -> &'static str {
    if v { "1" } else { "0" }
}

/// Figure out the SIMD width of a device that does not report one.
fn derive_simd_width(dev: &Device) -> (u32, (u32, u32)) {
    if dev.simd_width != 0 {
        return (dev.simd_width, dev.simd_range);
    }
    if dev.device_type.is_gpu() {
        match dev.vendor {
            Vendor::Nvidia => (32, (32, 32)),
            Vendor::Intel => (16, (8, 32)),
            Vendor::Apple => (32, (32, 32)),
            // AMD can be fixed SIMD32 or SIMD64; don't guess
            _ => (0, dev.simd_range),
        }
    } else if dev.device_type.is_cpu() {
        // at least 4 (SSE, newer NEON), 8-wide with AVX, 16-wide with AVX-512
        #[cfg(target_arch = "x86_64")]
        let width = if std::arch::is_x86_feature_detected!("avx512f") {
            16
        } else if std::arch::is_x86_feature_detected!("avx") {
            8
        } else {
            4
        };
        #[cfg(not(target_arch = "x86_64"))]
        let width = 4;
        (width, (1, width))
    } else {
        (0, dev.simd_range)
    }
}

#[cfg(target_arch = "x86_64")]
fn host_cpu_has_fma() -> bool {
    std::arch::is_x86_feature_detected!("fma")
}

#[cfg(target_arch = "aarch64")]
fn host_cpu_has_fma() -> bool {
    // all armv8 CPUs have fused multiply-add
    true
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn host_cpu_has_fma() -> bool {
    false
}

/// Emit the full device-info vocabulary into `cmd`.
pub(crate) fn emit_device_defines(cmd: &mut String, dev: &Device, options: &CompileOptions,
                                  primitive_id_support: bool, barycentric_coord_support: bool,
                                  disable_sub_groups: bool, os_override: Option<Os>) {
    let mut w = DefineWriter::new(cmd);

    w.info("VENDOR", dev.vendor.as_str());
    w.info("PLATFORM_VENDOR", dev.platform_vendor.as_str());
    let type_str = if dev.device_type.is_gpu() {
        "GPU"
    } else if dev.device_type.is_cpu() {
        "CPU"
    } else {
        "UNKNOWN"
    };
    w.info("TYPE", type_str);

    let os = if options.ignore_runtime_info {
        Os::Unknown
    } else {
        os_override.unwrap_or_else(Os::current)
    };
    w.info("OS", os.as_str());
    // TODO: figure out a meaningful OS version on non-Apple platforms
    w.info("OS_VERSION", 0);

    // assume all GPUs have fma support; CPUs are probed
    let has_fma = if dev.device_type.is_gpu() {
        true
    } else if dev.device_type.is_cpu() && !options.ignore_runtime_info {
        host_cpu_has_fma()
    } else {
        dev.fma_support
    };
    w.info("HAS_FMA", bool_str(has_fma));

    w.info("HAS_64_BIT_ATOMICS", bool_str(dev.basic_64_bit_atomics_support));
    w.info("HAS_NATIVE_EXTENDED_64_BIT_ATOMICS", bool_str(dev.extended_64_bit_atomics_support));
    w.info("HAS_32_BIT_FLOAT_ATOMICS", bool_str(dev.basic_32_bit_float_atomics_support));

    w.info("HAS_DEDICATED_LOCAL_MEMORY", bool_str(dev.local_mem_dedicated));
    w.info_u32("DEDICATED_LOCAL_MEMORY", dev.local_mem_size as u32);

    w.info("HAS_PRIMITIVE_ID", bool_str(primitive_id_support));
    w.info("HAS_BARYCENTRIC_COORD", bool_str(barycentric_coord_support));
    if primitive_id_support {
        w.flag("-Xclang -graphics-primitive-id");
    }
    if barycentric_coord_support {
        w.flag("-Xclang -graphics-barycentric-coord");
    }

    // id/size ranges as [min, max) pairs
    let mut global_id_range = (0u32, !0u32);
    let mut global_size_range = (1u32, !0u32);
    let mut group_id_range = (0u32, !0u32);
    let mut group_size_range = (1u32, !0u32);
    let max_global_size = dev.max_global_size_element();
    if max_global_size > 0 {
        global_id_range.1 = if max_global_size >= 0xFFFF_FFFF { !0 } else { max_global_size as u32 };
        global_size_range.1 =
            if max_global_size >= 0xFFFF_FFFF { !0 } else { max_global_size as u32 + 1 };
    }
    // default to the common max of 1024
    let mut local_id_range = (0u32, 1024u32);
    let mut local_size_range = (1u32, 1025u32);
    if dev.max_total_local_size != 0 {
        local_id_range.1 = dev.max_total_local_size;
        local_size_range.1 = dev.max_total_local_size + 1;
    }
    let max_group_size = dev.max_group_size.max_element();
    if max_group_size > 0 {
        group_id_range.1 = max_group_size;
        group_size_range.1 = if max_group_size != !0 { max_group_size + 1 } else { !0 };
    }

    w.info_u32("GLOBAL_ID_RANGE_MIN", global_id_range.0);
    w.info_u32("GLOBAL_ID_RANGE_MAX", global_id_range.1);
    w.info_u32("GLOBAL_SIZE_RANGE_MIN", global_size_range.0);
    w.info_u32("GLOBAL_SIZE_RANGE_MAX", global_size_range.1);
    w.info_u32("LOCAL_ID_RANGE_MIN", local_id_range.0);
    w.info_u32("LOCAL_ID_RANGE_MAX", local_id_range.1);
    w.info_u32("LOCAL_SIZE_RANGE_MIN", local_size_range.0);
    w.info_u32("LOCAL_SIZE_RANGE_MAX", local_size_range.1);
    w.info_u32("GROUP_ID_RANGE_MIN", group_id_range.0);
    w.info_u32("GROUP_ID_RANGE_MAX", group_id_range.1);
    w.info_u32("GROUP_SIZE_RANGE_MIN", group_size_range.0);
    w.info_u32("GROUP_SIZE_RANGE_MAX", group_size_range.1);

    let (simd_width, simd_range) = if options.ignore_runtime_info {
        (dev.simd_width, dev.simd_range)
    } else {
        derive_simd_width(dev)
    };
    w.info_u32("SIMD_WIDTH", simd_width);
    w.info_u32("SIMD_WIDTH_MIN", simd_range.0);
    w.info_u32("SIMD_WIDTH_MAX", simd_range.1);
    write!(w.cmd, " -DHC_DEVICE_INFO_SIMD_WIDTH_{simd_width}").expect("writing to a String");

    let sub_groups = dev.sub_group_support && !disable_sub_groups;
    if sub_groups {
        // sub-group ranges, using the work-group correspondence:
        // sub-group local id ^= local id, sub-group size ^= local size,
        // sub-group id ^= group id, num sub-groups ^= group size
        let mut sub_group_local_id_range = (0u32, 64u32);
        let mut sub_group_size_range = (1u32, local_size_range.1);
        let mut sub_group_id_range = (0u32, local_id_range.1);
        let mut num_sub_groups_range = (1u32, local_size_range.1);
        if dev.simd_width > 1 {
            sub_group_local_id_range.1 = dev.simd_range.1;
            sub_group_size_range = (dev.simd_range.0, dev.simd_range.1 + 1);
            let divisor =
                if dev.simd_range.0 == dev.simd_range.1 { dev.simd_range.1 } else { dev.simd_range.0 };
            sub_group_id_range.1 = local_id_range.1 / divisor;
            num_sub_groups_range.1 = local_id_range.1 / divisor + 1;
        }
        w.info_u32("SUB_GROUP_ID_RANGE_MIN", sub_group_id_range.0);
        w.info_u32("SUB_GROUP_ID_RANGE_MAX", sub_group_id_range.1);
        w.info_u32("SUB_GROUP_LOCAL_ID_RANGE_MIN", sub_group_local_id_range.0);
        w.info_u32("SUB_GROUP_LOCAL_ID_RANGE_MAX", sub_group_local_id_range.1);
        w.info_u32("SUB_GROUP_SIZE_RANGE_MIN", sub_group_size_range.0);
        w.info_u32("SUB_GROUP_SIZE_RANGE_MAX", sub_group_size_range.1);
        w.info_u32("NUM_SUB_GROUPS_RANGE_MIN", num_sub_groups_range.0);
        w.info_u32("NUM_SUB_GROUPS_RANGE_MAX", num_sub_groups_range.1);
    }
    w.info("HAS_SUB_GROUPS", bool_str(sub_groups));
    w.info("HAS_SUB_GROUP_SHUFFLE", bool_str(dev.sub_group_shuffle_support && !disable_sub_groups));
    w.info("HAS_COOPERATIVE_KERNEL", bool_str(dev.cooperative_kernel_support));

    w.info("HAS_IMAGE_SUPPORT", bool_str(dev.image_support));
    w.info("HAS_IMAGE_DEPTH_SUPPORT", bool_str(dev.image_depth_support));
    w.info("HAS_IMAGE_DEPTH_WRITE_SUPPORT", bool_str(dev.image_depth_write_support));
    w.info("HAS_IMAGE_MSAA_SUPPORT", bool_str(dev.image_msaa_support));
    w.info("HAS_IMAGE_MSAA_WRITE_SUPPORT", bool_str(dev.image_msaa_write_support));
    w.info("HAS_IMAGE_MSAA_ARRAY_SUPPORT", bool_str(dev.image_msaa_array_support));
    w.info("HAS_IMAGE_MSAA_ARRAY_WRITE_SUPPORT", bool_str(dev.image_msaa_array_write_support));
    w.info("HAS_IMAGE_CUBE_SUPPORT", bool_str(dev.image_cube_support));
    w.info("HAS_IMAGE_CUBE_WRITE_SUPPORT", bool_str(dev.image_cube_write_support));
    w.info("HAS_IMAGE_CUBE_ARRAY_SUPPORT", bool_str(dev.image_cube_array_support));
    w.info("HAS_IMAGE_CUBE_ARRAY_WRITE_SUPPORT", bool_str(dev.image_cube_array_write_support));
    w.info("HAS_IMAGE_MIPMAP_SUPPORT", bool_str(dev.image_mipmap_support));
    w.info("HAS_IMAGE_MIPMAP_WRITE_SUPPORT", bool_str(dev.image_mipmap_write_support));
    w.info("HAS_IMAGE_OFFSET_READ_SUPPORT", bool_str(dev.image_offset_read_support));
    w.info("HAS_IMAGE_OFFSET_WRITE_SUPPORT", bool_str(dev.image_offset_write_support));
    w.info("HAS_IMAGE_DEPTH_COMPARE_SUPPORT", bool_str(dev.image_depth_compare_support));
    w.info("HAS_IMAGE_GATHER_SUPPORT", bool_str(dev.image_gather_support));
    w.info("HAS_IMAGE_READ_WRITE_SUPPORT", bool_str(dev.image_read_write_support));

    let img_caps = ImageCapability::from_device(dev);
    write!(w.cmd, " -Xclang -hc-image-capabilities={}", img_caps.bits())
        .expect("writing to a String");
    w.info_u32("MAX_MIP_LEVELS", dev.max_mip_levels);

    w.info("INDIRECT_COMMAND_SUPPORT", bool_str(dev.indirect_command_support));
    w.info("INDIRECT_COMPUTE_COMMAND_SUPPORT", bool_str(dev.indirect_compute_command_support));
    w.info("INDIRECT_RENDER_COMMAND_SUPPORT", bool_str(dev.indirect_render_command_support));

    w.info("TESSELLATION_SUPPORT", bool_str(dev.tessellation_support));
    w.info_u32("MAX_TESSELLATION_FACTOR", dev.max_tessellation_factor);

    w.info("HAS_ARGUMENT_BUFFER_SUPPORT", bool_str(dev.argument_buffer_support));
    w.info("HAS_ARGUMENT_BUFFER_IMAGE_SUPPORT", bool_str(dev.argument_buffer_image_support));

    if dev.param_workaround {
        w.flag("-DHC_DEVICE_PARAM_WORKAROUND=1");
    }

    let assert_str = bool_str(options.enable_assert);
    w.flag(&format!("-DHC_ASSERT={assert_str} -DHC_ASSERT_{assert_str}"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Target;
    use hcapi::{BackendInfo, DeviceType, HostCpuTier, UInt3};

    fn sample_device() -> Device {
        Device {
            name: "test cpu".into(),
            vendor: Vendor::Intel,
            platform_vendor: Vendor::Intel,
            device_type: DeviceType::Cpu,
            units: 8,
            basic_64_bit_atomics_support: true,
            local_mem_dedicated: true,
            local_mem_size: 64 * 1024,
            sub_group_support: true,
            sub_group_shuffle_support: true,
            image_support: true,
            image_depth_support: true,
            max_mip_levels: 14,
            max_global_size: [1 << 40, 1 << 16, 1 << 16],
            max_group_size: UInt3::splat(1 << 16),
            max_total_local_size: 1024,
            simd_width: 16,
            simd_range: (16, 16),
            backend: BackendInfo::Host { cpu_tier: HostCpuTier::X86Tier3 },
            ..Device::default()
        }
    }

    #[test]
    fn emits_valued_and_marker_defines() {
        let mut cmd = String::new();
        let options = CompileOptions::new(Target::HostCompute);
        emit_device_defines(&mut cmd, &sample_device(), &options, false, false, false,
                            Some(Os::Linux));
        assert!(cmd.contains("-DHC_DEVICE_INFO_VENDOR=INTEL"));
        assert!(cmd.contains("-DHC_DEVICE_INFO_VENDOR_INTEL"));
        assert!(cmd.contains("-DHC_DEVICE_INFO_TYPE=CPU"));
        assert!(cmd.contains("-DHC_DEVICE_INFO_OS=LINUX"));
        assert!(cmd.contains("-DHC_DEVICE_INFO_HAS_64_BIT_ATOMICS=1"));
        assert!(cmd.contains("-DHC_DEVICE_INFO_HAS_64_BIT_ATOMICS_1"));
        assert!(cmd.contains("-DHC_DEVICE_INFO_DEDICATED_LOCAL_MEMORY=65536u"));
        assert!(cmd.contains("-DHC_DEVICE_INFO_SIMD_WIDTH=16u"));
        assert!(cmd.contains("-DHC_DEVICE_INFO_SIMD_WIDTH_16"));
        assert!(cmd.contains("-DHC_DEVICE_INFO_HAS_SUB_GROUPS=1"));
        assert!(cmd.contains("-DHC_DEVICE_INFO_MAX_MIP_LEVELS=14u"));
        assert!(cmd.contains("-DHC_ASSERT=0"));
        // image caps bitset: basic | depth read
        assert!(cmd.contains("-Xclang -hc-image-capabilities=3"));
    }

    #[test]
    fn local_ranges_derive_from_max_total_local_size() {
        let mut cmd = String::new();
        let options = CompileOptions::new(Target::HostCompute);
        emit_device_defines(&mut cmd, &sample_device(), &options, false, false, false,
                            Some(Os::Linux));
        assert!(cmd.contains("-DHC_DEVICE_INFO_LOCAL_ID_RANGE_MAX=1024u"));
        assert!(cmd.contains("-DHC_DEVICE_INFO_LOCAL_SIZE_RANGE_MAX=1025u"));
        // fixed SIMD16 device: sub-group id range max = 1024 / 16
        assert!(cmd.contains("-DHC_DEVICE_INFO_SUB_GROUP_ID_RANGE_MAX=64u"));
        assert!(cmd.contains("-DHC_DEVICE_INFO_SUB_GROUP_SIZE_RANGE_MAX=17u"));
    }

    #[test]
    fn sub_group_defines_respect_disable_flag() {
        let mut cmd = String::new();
        let options = CompileOptions::new(Target::HostCompute);
        emit_device_defines(&mut cmd, &sample_device(), &options, false, false, true,
                            Some(Os::Linux));
        assert!(cmd.contains("-DHC_DEVICE_INFO_HAS_SUB_GROUPS=0"));
        assert!(!cmd.contains("SUB_GROUP_ID_RANGE_MAX"));
    }
}
