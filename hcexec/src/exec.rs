//! Per-worker execution contexts and the C ABI surface kernels call into.
//!
//! Two thread-local contexts exist per worker: one for "host" kernels that
//! were compiled into this process, one for "device" kernels loaded from a
//! Host-Compute ELF binary (whose id block lives in the per-CPU instance).
//! Barriers and SIMD group operations suspend the calling fiber by swapping
//! to the next fiber in the work-group (or sub-group) ring; memory fences do
//! not suspend.

use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::sync::atomic::{Ordering, fence};

use hcapi::limits::{LOCAL_MEMORY_SIZE, SIMD_WIDTH};
use hcapi::{KernelIds, UInt3};

use crate::fiber::{FiberContext, current_context};
use crate::runtime::HostRuntime;

/// One 16-byte SIMD exchange slot per work-item.
#[repr(C, align(16))]
#[derive(Clone, Copy, Default)]
pub struct SimdValue(pub [u8; 16]);

impl SimdValue {
    fn u32(&self) -> u32 {
        u32::from_ne_bytes(self.0[..4].try_into().expect("4 bytes"))
    }

    fn set_u32(&mut self, v: u32) {
        self.0[..4].copy_from_slice(&v.to_ne_bytes());
    }
}

/// A kernel entry point bound to its marshalled argument pointers.
#[derive(Clone)]
pub(crate) struct KernelCall {
    func: *const c_void,
    args: Vec<*const c_void>,
}

// The pointers target caller-owned buffers that outlive the dispatch.
unsafe impl Send for KernelCall {}

macro_rules! arg_at {
    ($args:expr, $i:literal) => {
        $args[$i]
    };
}

macro_rules! arity_arm {
    ($func:expr, $args:expr, $($i:literal)*) => {{
        let f: unsafe extern "C" fn($(arg_ty!($i)),*) = unsafe { core::mem::transmute($func) };
        unsafe { f($(arg_at!($args, $i)),*) }
    }};
}

macro_rules! arg_ty {
    ($i:literal) => { *const c_void };
}

impl KernelCall {
    pub(crate) fn new(func: *const c_void, args: Vec<*const c_void>) -> KernelCall {
        KernelCall { func, args }
    }

    /// Rebind the entry pointer, keeping the marshalled arguments. Device
    /// workers use this to bind their per-instance function pointer.
    pub(crate) fn with_function(mut self, func: *const c_void) -> KernelCall {
        self.func = func;
        self
    }

    /// Dispatch through a function-pointer cast of the matching arity.
    /// The dispatcher has already rejected argument counts above 32.
    pub(crate) unsafe fn invoke(&self) {
        let f = self.func;
        let a = &self.args;
        match a.len() {
            0 => arity_arm!(f, a,),
            1 => arity_arm!(f, a, 0),
            2 => arity_arm!(f, a, 0 1),
            3 => arity_arm!(f, a, 0 1 2),
            4 => arity_arm!(f, a, 0 1 2 3),
            5 => arity_arm!(f, a, 0 1 2 3 4),
            6 => arity_arm!(f, a, 0 1 2 3 4 5),
            7 => arity_arm!(f, a, 0 1 2 3 4 5 6),
            8 => arity_arm!(f, a, 0 1 2 3 4 5 6 7),
            9 => arity_arm!(f, a, 0 1 2 3 4 5 6 7 8),
            10 => arity_arm!(f, a, 0 1 2 3 4 5 6 7 8 9),
            11 => arity_arm!(f, a, 0 1 2 3 4 5 6 7 8 9 10),
            12 => arity_arm!(f, a, 0 1 2 3 4 5 6 7 8 9 10 11),
            13 => arity_arm!(f, a, 0 1 2 3 4 5 6 7 8 9 10 11 12),
            14 => arity_arm!(f, a, 0 1 2 3 4 5 6 7 8 9 10 11 12 13),
            15 => arity_arm!(f, a, 0 1 2 3 4 5 6 7 8 9 10 11 12 13 14),
            16 => arity_arm!(f, a, 0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15),
            17 => arity_arm!(f, a, 0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16),
            18 => arity_arm!(f, a, 0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17),
            19 => arity_arm!(f, a, 0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18),
            20 => arity_arm!(f, a, 0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19),
            21 => arity_arm!(f, a, 0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20),
            22 => arity_arm!(f, a, 0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21),
            23 => arity_arm!(f, a, 0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22),
            24 => arity_arm!(f, a, 0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22 23),
            25 => arity_arm!(f, a,
                0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22 23 24),
            26 => arity_arm!(f, a,
                0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22 23 24 25),
            27 => arity_arm!(f, a,
                0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22 23 24 25 26),
            28 => arity_arm!(f, a,
                0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22 23 24 25 26 27),
            29 => arity_arm!(f, a,
                0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22 23 24 25 26 27 28),
            30 => arity_arm!(f, a,
                0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22 23 24 25 26 27 28
                29),
            31 => arity_arm!(f, a,
                0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22 23 24 25 26 27 28
                29 30),
            32 => arity_arm!(f, a,
                0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22 23 24 25 26 27 28
                29 30 31),
            n => unreachable!("argument count {n} must have been rejected"),
        }
    }
}

/// State shared by the host and device execution contexts of one worker.
pub(crate) struct ExecState {
    /// Linear 1D local size, for barrier ring arithmetic.
    pub linear_local_work_size: u32,
    /// The work-group's fiber array.
    pub item_contexts: *mut FiberContext,
    /// One exchange slot per work-item.
    pub simd_storage: Vec<SimdValue>,
    /// Barrier-misuse detector: decremented as work-items return.
    pub unfinished_items: u32,
    pub local_memory_exceeded: bool,
    pub local_memory_alloc_offset: u32,
    pub function: Option<KernelCall>,
}

impl ExecState {
    const fn new() -> ExecState {
        ExecState {
            linear_local_work_size: 0,
            item_contexts: core::ptr::null_mut(),
            simd_storage: Vec::new(),
            unfinished_items: 0,
            local_memory_exceeded: false,
            local_memory_alloc_offset: 0,
            function: None,
        }
    }
}

/// Execution context for kernels compiled into this process.
pub(crate) struct HostExecContext {
    pub ids: KernelIds,
    /// Base of the process-wide local-memory arena.
    pub local_memory_base: *mut u8,
    /// This worker's slice offset within the local-memory arena.
    pub thread_local_memory_offset: u32,
    pub state: ExecState,
}

/// Execution context for kernels loaded from a Host-Compute ELF binary; the
/// id block lives inside the per-CPU instance.
pub(crate) struct DeviceExecContext {
    pub ids: *mut KernelIds,
    pub state: ExecState,
}

thread_local! {
    static HOST_EXEC: UnsafeCell<HostExecContext> = const {
        UnsafeCell::new(HostExecContext {
            ids: KernelIds {
                global_idx: UInt3::new(0, 0, 0),
                global_work_size: UInt3::new(0, 0, 0),
                local_idx: UInt3::new(0, 0, 0),
                local_work_size: UInt3::new(0, 0, 0),
                group_idx: UInt3::new(0, 0, 0),
                group_size: UInt3::new(0, 0, 0),
                work_dim: 0,
                local_linear_idx: 0,
                sub_group_idx: 0,
                sub_group_local_idx: 0,
                sub_group_size: 0,
                num_sub_groups: 0,
            },
            local_memory_base: core::ptr::null_mut(),
            thread_local_memory_offset: 0,
            state: ExecState::new(),
        })
    };
    static DEVICE_EXEC: UnsafeCell<DeviceExecContext> = const {
        UnsafeCell::new(DeviceExecContext {
            ids: core::ptr::null_mut(),
            state: ExecState::new(),
        })
    };
}

/// The worker owns its thread-local context; fibers running on this worker
/// access it through these raw accessors.
pub(crate) fn host_exec<'a>() -> &'a mut HostExecContext {
    unsafe { &mut *HOST_EXEC.with(|c| c.get()) }
}

pub(crate) fn device_exec<'a>() -> &'a mut DeviceExecContext {
    unsafe { &mut *DEVICE_EXEC.with(|c| c.get()) }
}

/// Which of the two contexts the current worker drives; the dispatcher sets
/// this so the group loop can poll the right state.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActiveState {
    Host,
    Device,
}

thread_local! {
    static ACTIVE_STATE: core::cell::Cell<ActiveState> =
        const { core::cell::Cell::new(ActiveState::Host) };
}

pub(crate) fn set_active_state(which: ActiveState) {
    ACTIVE_STATE.with(|c| c.set(which));
}

pub(crate) fn active_state<'a>() -> &'a mut ExecState {
    match ACTIVE_STATE.with(|c| c.get()) {
        ActiveState::Host => &mut host_exec().state,
        ActiveState::Device => &mut device_exec().state,
    }
}

fn split_local(local_linear_idx: u32, local_work_size: UInt3) -> UInt3 {
    UInt3::new(
        local_linear_idx % local_work_size.x,
        (local_linear_idx / local_work_size.x) % local_work_size.y,
        local_linear_idx / (local_work_size.x * local_work_size.y),
    )
}

fn set_item_ids(ids: &mut KernelIds, local_linear_idx: u32) {
    let local_id = split_local(local_linear_idx, ids.local_work_size);
    ids.local_idx = local_id;
    ids.local_linear_idx = local_linear_idx;
    ids.sub_group_idx = local_linear_idx / SIMD_WIDTH;
    ids.sub_group_local_idx = local_linear_idx % SIMD_WIDTH;
    ids.global_idx = UInt3::new(
        ids.group_idx.x * ids.local_work_size.x + local_id.x,
        ids.group_idx.y * ids.local_work_size.y + local_id.y,
        ids.group_idx.z * ids.local_work_size.z + local_id.z,
    );
}

/// Cache the per-item ids on the fiber record, so barriers can restore the
/// shared id block after a swap without stomping other fibers' state.
fn cache_ids_on_fiber(ids: &KernelIds, local_linear_idx: u32) {
    let this_ctx = current_context();
    unsafe {
        debug_assert_eq!((*this_ctx).local_linear_idx, local_linear_idx);
        (*this_ctx).sub_group_idx = ids.sub_group_idx;
        (*this_ctx).sub_group_local_idx = ids.sub_group_local_idx;
        (*this_ctx).global_idx = ids.global_idx;
        (*this_ctx).local_idx = ids.local_idx;
    }
}

/// Fiber entry point for host kernels.
pub(crate) unsafe extern "C" fn run_host_group_item(local_linear_idx: u32) {
    let ctx = host_exec();
    set_item_ids(&mut ctx.ids, local_linear_idx);
    cache_ids_on_fiber(&ctx.ids, local_linear_idx);

    // clone the bound call so no borrow into the context is held while the
    // kernel (and its barriers) run
    if let Some(func) = ctx.state.function.clone() {
        unsafe { func.invoke() };
    }

    host_exec().state.unfinished_items -= 1;
}

/// Fiber entry point for device (ELF) kernels.
pub(crate) unsafe extern "C" fn run_device_group_item(local_linear_idx: u32) {
    let ctx = device_exec();
    let ids = unsafe { &mut *ctx.ids };
    set_item_ids(ids, local_linear_idx);
    cache_ids_on_fiber(ids, local_linear_idx);

    if let Some(func) = ctx.state.function.clone() {
        unsafe { func.invoke() };
    }

    device_exec().state.unfinished_items -= 1;
}

/// Swap to the next fiber in the work-group ring (`SIMD == false`) or to the
/// next lane of the current sub-group (`SIMD == true`), then restore the id
/// block for the resumed fiber.
fn fiber_swap<const SIMD: bool>(state: &mut ExecState, ids: &mut KernelIds) {
    let this_ctx = current_context();
    unsafe {
        let next_idx =
            if SIMD { (*this_ctx).next_simd_ctx_idx } else { (*this_ctx).next_linear_ctx_idx };
        let next = state.item_contexts.add(next_idx as usize);
        (*this_ctx).swap_context(next);

        let this_ctx = current_context();
        ids.restore((*this_ctx).global_idx, (*this_ctx).local_idx, (*this_ctx).local_linear_idx,
                    (*this_ctx).sub_group_idx, (*this_ctx).sub_group_local_idx);
    }
}

// Work-group barriers. The same barrier must be encountered at the same
// program point by every work-item of the group.

#[unsafe(no_mangle)]
pub extern "C" fn global_barrier() {
    let ctx = host_exec();
    fiber_swap::<false>(&mut ctx.state, &mut ctx.ids);
}

#[unsafe(no_mangle)]
pub extern "C" fn local_barrier() {
    global_barrier();
}

#[unsafe(no_mangle)]
pub extern "C" fn barrier() {
    global_barrier();
}

#[unsafe(no_mangle)]
pub extern "C" fn image_barrier() {
    global_barrier();
}

#[unsafe(no_mangle)]
pub extern "C" fn simd_barrier() {
    let ctx = host_exec();
    fiber_swap::<true>(&mut ctx.state, &mut ctx.ids);
}

#[unsafe(no_mangle)]
pub extern "C" fn hc_device_barrier() {
    let ctx = device_exec();
    fiber_swap::<false>(&mut ctx.state, unsafe { &mut *ctx.ids });
}

#[unsafe(no_mangle)]
pub extern "C" fn hc_device_simd_barrier() {
    let ctx = device_exec();
    fiber_swap::<true>(&mut ctx.state, unsafe { &mut *ctx.ids });
}

// Memory fences compile to a full fence on the executing CPU and never
// suspend the fiber.

#[unsafe(no_mangle)]
pub extern "C" fn global_mem_fence() {
    fence(Ordering::SeqCst);
}

#[unsafe(no_mangle)]
pub extern "C" fn global_read_mem_fence() {
    global_mem_fence();
}

#[unsafe(no_mangle)]
pub extern "C" fn global_write_mem_fence() {
    global_mem_fence();
}

#[unsafe(no_mangle)]
pub extern "C" fn local_mem_fence() {
    global_mem_fence();
}

#[unsafe(no_mangle)]
pub extern "C" fn local_read_mem_fence() {
    global_mem_fence();
}

#[unsafe(no_mangle)]
pub extern "C" fn local_write_mem_fence() {
    global_mem_fence();
}

#[unsafe(no_mangle)]
pub extern "C" fn image_mem_fence() {
    global_mem_fence();
}

#[unsafe(no_mangle)]
pub extern "C" fn image_read_mem_fence() {
    global_mem_fence();
}

#[unsafe(no_mangle)]
pub extern "C" fn image_write_mem_fence() {
    global_mem_fence();
}

/// Bump-allocate storage for a kernel's local-memory buffer out of this
/// worker's 64 KiB slice. On overflow, flag the condition and yield to the
/// main context; the worker reports the failure and stops its group loop.
///
/// # Safety
/// Must be called from a work-item fiber; `offset` must be writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hc_requisition_local_memory(size: usize, offset: *mut u32) -> *mut u8 {
    let ctx = host_exec();
    if ctx.state.local_memory_alloc_offset as usize + size > LOCAL_MEMORY_SIZE {
        ctx.state.local_memory_exceeded = true;
        let linear = ctx.ids.local_linear_idx;
        unsafe { (*ctx.state.item_contexts.add(linear as usize)).exit_to_main() };
    }

    // Round the per-item allocation up to 128 bytes; the offset handed out is
    // the unpadded position.
    let per_alloc_size = size.next_multiple_of(128);
    unsafe { *offset = ctx.state.local_memory_alloc_offset };
    ctx.state.local_memory_alloc_offset += per_alloc_size as u32;
    ctx.local_memory_base
}

#[unsafe(no_mangle)]
pub extern "C" fn hc_thread_local_memory_offset_get() -> u32 {
    host_exec().thread_local_memory_offset
}

// Id getters for host kernels (device kernels import the id block fields as
// data symbols instead).

#[unsafe(no_mangle)]
pub extern "C" fn hc_global_idx_get() -> UInt3 {
    host_exec().ids.global_idx
}

#[unsafe(no_mangle)]
pub extern "C" fn hc_local_idx_get() -> UInt3 {
    host_exec().ids.local_idx
}

#[unsafe(no_mangle)]
pub extern "C" fn hc_group_idx_get() -> UInt3 {
    host_exec().ids.group_idx
}

#[unsafe(no_mangle)]
pub extern "C" fn hc_work_dim_get() -> u32 {
    host_exec().ids.work_dim
}

#[unsafe(no_mangle)]
pub extern "C" fn hc_global_work_size_get() -> UInt3 {
    host_exec().ids.global_work_size
}

#[unsafe(no_mangle)]
pub extern "C" fn hc_local_work_size_get() -> UInt3 {
    host_exec().ids.local_work_size
}

#[unsafe(no_mangle)]
pub extern "C" fn hc_group_size_get() -> UInt3 {
    host_exec().ids.group_size
}

#[unsafe(no_mangle)]
pub extern "C" fn hc_local_linear_idx_get() -> u32 {
    host_exec().ids.local_linear_idx
}

#[unsafe(no_mangle)]
pub extern "C" fn hc_sub_group_id_get() -> u32 {
    host_exec().ids.sub_group_idx
}

#[unsafe(no_mangle)]
pub extern "C" fn hc_sub_group_local_id_get() -> u32 {
    host_exec().ids.sub_group_local_idx
}

#[unsafe(no_mangle)]
pub extern "C" fn hc_sub_group_size_get() -> u32 {
    host_exec().ids.sub_group_size
}

#[unsafe(no_mangle)]
pub extern "C" fn hc_num_sub_groups_get() -> u32 {
    host_exec().ids.num_sub_groups
}

#[unsafe(no_mangle)]
pub extern "C" fn hc_device_printf_buffer() -> *mut u32 {
    match HostRuntime::try_get() {
        Ok(runtime) => runtime.printf_buffer_ptr(),
        Err(_) => core::ptr::null_mut(),
    }
}

// SIMD sub-group operations. Each work-item deposits its operand in its
// exchange slot and propagates a SIMD barrier through the sub-group; once the
// swap returns, every lane of the sub-group has deposited and the source
// slot can be read.

fn simd_ballot_impl(state: &mut ExecState, ids: &mut KernelIds, predicate: bool) -> u32 {
    let this_ctx = current_context();
    let linear = unsafe { (*this_ctx).local_linear_idx } as usize;
    state.simd_storage[linear].set_u32(predicate as u32);
    fiber_swap::<true>(state, ids);

    // The first lane of each sub-group reduces the ballot and fans the result
    // back out; reading from a shared slot directly would race with the next
    // SIMD operation.
    unsafe {
        if (*this_ctx).sub_group_local_idx == 0 {
            let group_offset = ((*this_ctx).sub_group_idx * SIMD_WIDTH) as usize;
            let mut ballot_mask = 0u32;
            for i in 0..SIMD_WIDTH as usize {
                ballot_mask |= (state.simd_storage[group_offset + i].u32() & 0x1) << i;
            }
            for i in 0..SIMD_WIDTH as usize {
                state.simd_storage[group_offset + i].set_u32(ballot_mask);
            }
        }
        state.simd_storage[(*this_ctx).local_linear_idx as usize].u32()
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn hc_simd_ballot(predicate: bool) -> u32 {
    let ctx = host_exec();
    simd_ballot_impl(&mut ctx.state, &mut ctx.ids, predicate)
}

#[unsafe(no_mangle)]
pub extern "C" fn hc_device_simd_ballot(predicate: bool) -> u32 {
    let ctx = device_exec();
    simd_ballot_impl(&mut ctx.state, unsafe { &mut *ctx.ids }, predicate)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SimdOp {
    Shuffle,
    ShuffleDown,
    ShuffleUp,
    ShuffleXor,
}

fn simd_shuffle_impl(op: SimdOp, state: &mut ExecState, ids: &mut KernelIds, value: SimdValue,
                     lane_idx_delta_or_mask: u32) -> SimdValue {
    let this_ctx = current_context();
    let linear = unsafe { (*this_ctx).local_linear_idx } as usize;
    state.simd_storage[linear] = value;

    fiber_swap::<true>(state, ids);

    let lane_idx = unsafe { (*this_ctx).sub_group_local_idx };
    let src_lane_idx = match op {
        SimdOp::Shuffle => lane_idx_delta_or_mask,
        SimdOp::ShuffleDown => lane_idx.wrapping_add(lane_idx_delta_or_mask),
        SimdOp::ShuffleUp => lane_idx.wrapping_sub(lane_idx_delta_or_mask),
        SimdOp::ShuffleXor => lane_idx ^ lane_idx_delta_or_mask,
    };
    // Out-of-range source lanes fall back to the caller's own value.
    let src_lane_idx = if src_lane_idx >= SIMD_WIDTH { lane_idx } else { src_lane_idx };
    let group_offset = unsafe { (*this_ctx).sub_group_idx } * SIMD_WIDTH;
    let ret = state.simd_storage[(group_offset + src_lane_idx) as usize];

    // Close the operation so a subsequent SIMD op can reuse the storage.
    fiber_swap::<true>(state, ids);
    ret
}

macro_rules! simd_shuffle_fns {
    ($(($host_name:ident, $device_name:ident, $op:expr, $ty:ty)),* $(,)?) => {
        $(
            #[unsafe(no_mangle)]
            pub extern "C" fn $host_name(value: $ty, lane_idx_delta_or_mask: u32) -> $ty {
                let ctx = host_exec();
                let mut slot = SimdValue::default();
                slot.0[..size_of::<$ty>()].copy_from_slice(&value.to_ne_bytes());
                let out = simd_shuffle_impl($op, &mut ctx.state, &mut ctx.ids, slot,
                                            lane_idx_delta_or_mask);
                <$ty>::from_ne_bytes(out.0[..size_of::<$ty>()].try_into().expect("slot bytes"))
            }

            #[unsafe(no_mangle)]
            pub extern "C" fn $device_name(value: $ty, lane_idx_delta_or_mask: u32) -> $ty {
                let ctx = device_exec();
                let mut slot = SimdValue::default();
                slot.0[..size_of::<$ty>()].copy_from_slice(&value.to_ne_bytes());
                let out = simd_shuffle_impl($op, &mut ctx.state, unsafe { &mut *ctx.ids }, slot,
                                            lane_idx_delta_or_mask);
                <$ty>::from_ne_bytes(out.0[..size_of::<$ty>()].try_into().expect("slot bytes"))
            }
        )*
    };
}

simd_shuffle_fns!(
    (hc_simd_shuffle_u32, hc_device_simd_shuffle_u32, SimdOp::Shuffle, u32),
    (hc_simd_shuffle_down_u32, hc_device_simd_shuffle_down_u32, SimdOp::ShuffleDown, u32),
    (hc_simd_shuffle_up_u32, hc_device_simd_shuffle_up_u32, SimdOp::ShuffleUp, u32),
    (hc_simd_shuffle_xor_u32, hc_device_simd_shuffle_xor_u32, SimdOp::ShuffleXor, u32),
    (hc_simd_shuffle_i32, hc_device_simd_shuffle_i32, SimdOp::Shuffle, i32),
    (hc_simd_shuffle_down_i32, hc_device_simd_shuffle_down_i32, SimdOp::ShuffleDown, i32),
    (hc_simd_shuffle_up_i32, hc_device_simd_shuffle_up_i32, SimdOp::ShuffleUp, i32),
    (hc_simd_shuffle_xor_i32, hc_device_simd_shuffle_xor_i32, SimdOp::ShuffleXor, i32),
    (hc_simd_shuffle_f32, hc_device_simd_shuffle_f32, SimdOp::Shuffle, f32),
    (hc_simd_shuffle_down_f32, hc_device_simd_shuffle_down_f32, SimdOp::ShuffleDown, f32),
    (hc_simd_shuffle_up_f32, hc_device_simd_shuffle_up_f32, SimdOp::ShuffleUp, f32),
    (hc_simd_shuffle_xor_f32, hc_device_simd_shuffle_xor_f32, SimdOp::ShuffleXor, f32),
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_local_linearisation() {
        let local = UInt3::new(4, 2, 2);
        assert_eq!(split_local(0, local), UInt3::new(0, 0, 0));
        assert_eq!(split_local(5, local), UInt3::new(1, 1, 0));
        assert_eq!(split_local(15, local), UInt3::new(3, 1, 1));
    }

    #[test]
    fn simd_value_roundtrip() {
        let mut v = SimdValue::default();
        v.set_u32(0xDEAD_BEEF);
        assert_eq!(v.u32(), 0xDEAD_BEEF);
    }
}
