use crate::UInt3;
use crate::limits;

/// Per-work-item identity block.
///
/// One of these lives inside every per-CPU instance. Device binaries import
/// the individual fields as external symbols (`hc_global_idx`,
/// `hc_local_work_size`, ...), so the layout is a fixed ABI: `#[repr(C)]`,
/// field order as declared.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelIds {
    pub global_idx: UInt3,
    pub global_work_size: UInt3,
    pub local_idx: UInt3,
    pub local_work_size: UInt3,
    pub group_idx: UInt3,
    pub group_size: UInt3,
    pub work_dim: u32,
    pub local_linear_idx: u32,
    pub sub_group_idx: u32,
    pub sub_group_local_idx: u32,
    pub sub_group_size: u32,
    pub num_sub_groups: u32,
}

impl KernelIds {
    /// Reset the constant portion for a new dispatch; the per-item fields are
    /// filled in by the work-group executor on every fiber swap.
    pub fn reset(&mut self, global_work_size: UInt3, local_work_size: UInt3, group_size: UInt3,
                 work_dim: u32) {
        let local_size = local_work_size.linear() as u32;
        *self = KernelIds {
            global_idx: UInt3::zero(),
            global_work_size,
            local_idx: UInt3::zero(),
            local_work_size,
            group_idx: UInt3::zero(),
            group_size,
            work_dim,
            local_linear_idx: 0,
            sub_group_idx: 0,
            sub_group_local_idx: 0,
            sub_group_size: limits::SIMD_WIDTH,
            num_sub_groups: local_size.div_ceil(limits::SIMD_WIDTH),
        };
    }

    /// Restore the per-item fields from values cached on a fiber record,
    /// used after a context swap returns control to a fiber.
    pub fn restore(&mut self, global_idx: UInt3, local_idx: UInt3, local_linear_idx: u32,
                   sub_group_idx: u32, sub_group_local_idx: u32) {
        self.global_idx = global_idx;
        self.local_idx = local_idx;
        self.local_linear_idx = local_linear_idx;
        self.sub_group_idx = sub_group_idx;
        self.sub_group_local_idx = sub_group_local_idx;
    }
}
