//! End-to-end dispatch tests using kernels compiled into the test binary.
//!
//! These drive the full fiber path: worker spawn, group ticketing, barriers,
//! SIMD group operations and the local-memory allocator.

use core::cell::Cell;
use core::ffi::c_void;

use hcapi::UInt3;
use hcapi::limits::SIMD_WIDTH;
use hcexec::exec::{
    hc_global_idx_get, hc_local_linear_idx_get, hc_requisition_local_memory, hc_simd_ballot,
    hc_simd_shuffle_u32, hc_thread_local_memory_offset_get, local_barrier,
};
use hcexec::{ExecError, HostBuffer, HostKernel, KernelArg};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

unsafe extern "C" fn identity_kernel(input: *const c_void, output: *const c_void) {
    let gid = hc_global_idx_get().x as usize;
    unsafe {
        let input = input as *const u32;
        let output = output as *mut u32;
        *output.add(gid) = *input.add(gid);
    }
}

#[test]
fn identity_dispatch_copies_the_input() {
    init_logging();
    let input = HostBuffer::from_u32_slice(&(0..1024).collect::<Vec<u32>>());
    let output = HostBuffer::new(1024 * 4);

    let kernel = HostKernel::from_host_function("identity_kernel",
                                                identity_kernel as *const c_void, None);
    let completed = Cell::new(false);
    kernel
        .execute(1, UInt3::new(1024, 1, 1), UInt3::new(32, 1, 1),
                 &[KernelArg::Buffer(&input), KernelArg::Buffer(&output)],
                 Some(Box::new(|| completed.set(true))))
        .unwrap();

    assert!(completed.get());
    assert_eq!(output.to_u32_vec(), (0..1024).collect::<Vec<u32>>());
}

thread_local! {
    static LOCAL_BUF: Cell<*mut u32> = const { Cell::new(core::ptr::null_mut()) };
}

unsafe extern "C" fn barrier_rotate_kernel(output: *const c_void) {
    let gid = hc_global_idx_get().x;
    let lid = hc_local_linear_idx_get();

    // The first work-item of the group claims the group's local buffer; all
    // fibers of a group share this worker thread, so a thread-local is
    // visible to every one of them.
    if lid == 0 {
        let mut offset = 0u32;
        unsafe {
            let base = hc_requisition_local_memory(16 * 4, &mut offset);
            let slot = base.add((hc_thread_local_memory_offset_get() + offset) as usize);
            LOCAL_BUF.with(|b| b.set(slot as *mut u32));
        }
    }
    local_barrier();

    let buf = LOCAL_BUF.with(|b| b.get());
    unsafe { *buf.add(lid as usize) = gid };
    local_barrier();

    unsafe {
        let output = output as *mut u32;
        *output.add(gid as usize) = *buf.add(((lid + 1) % 16) as usize);
    }
}

#[test]
fn barriers_synchronise_the_work_group() {
    init_logging();
    let output = HostBuffer::new(1024 * 4);
    let kernel = HostKernel::from_host_function("barrier_rotate_kernel",
                                                barrier_rotate_kernel as *const c_void, None);
    kernel
        .execute(1, UInt3::new(1024, 1, 1), UInt3::new(16, 1, 1),
                 &[KernelArg::Buffer(&output)], None)
        .unwrap();

    let result = output.to_u32_vec();
    for i in 0..1024u32 {
        assert_eq!(result[i as usize], (i & !15) + ((i + 1) & 15), "work-item {i}");
    }
}

unsafe extern "C" fn simd_broadcast_kernel(output: *const c_void) {
    let gid = hc_global_idx_get().x;
    let lane0_gid = hc_simd_shuffle_u32(gid, 0);
    unsafe { *(output as *mut u32).add(gid as usize) = lane0_gid };
}

#[test]
fn simd_shuffle_broadcasts_lane_zero() {
    init_logging();
    assert_eq!(SIMD_WIDTH, 16);
    let output = HostBuffer::new(1024 * 4);
    let kernel = HostKernel::from_host_function("simd_broadcast_kernel",
                                                simd_broadcast_kernel as *const c_void, None);
    kernel
        .execute(1, UInt3::new(1024, 1, 1), UInt3::new(16, 1, 1),
                 &[KernelArg::Buffer(&output)], None)
        .unwrap();

    let result = output.to_u32_vec();
    for i in 0..1024u32 {
        assert_eq!(result[i as usize], i & !15, "work-item {i}");
    }
}

unsafe extern "C" fn ballot_kernel(output: *const c_void) {
    let gid = hc_global_idx_get().x;
    let mask = hc_simd_ballot(true);
    unsafe { *(output as *mut u32).add(gid as usize) = mask };
}

#[test]
fn ballot_sees_all_lanes() {
    init_logging();
    let output = HostBuffer::new(64 * 4);
    let kernel =
        HostKernel::from_host_function("ballot_kernel", ballot_kernel as *const c_void, None);
    kernel
        .execute(1, UInt3::new(64, 1, 1), UInt3::new(16, 1, 1), &[KernelArg::Buffer(&output)],
                 None)
        .unwrap();

    for (i, mask) in output.to_u32_vec().into_iter().enumerate() {
        assert_eq!(mask, 0xFFFF, "work-item {i}");
    }
}

unsafe extern "C" fn single_item_kernel(output: *const c_void) {
    let gid = hc_global_idx_get().x;
    // A one-fiber group must still pass its barrier without deadlocking.
    local_barrier();
    unsafe { *(output as *mut u32).add(gid as usize) = gid + 1 };
}

#[test]
fn single_item_groups_pass_barriers() {
    init_logging();
    let output = HostBuffer::new(4 * 4);
    let kernel = HostKernel::from_host_function("single_item_kernel",
                                                single_item_kernel as *const c_void, None);
    kernel
        .execute(1, UInt3::new(4, 1, 1), UInt3::new(1, 1, 1), &[KernelArg::Buffer(&output)],
                 None)
        .unwrap();
    assert_eq!(output.to_u32_vec(), vec![1, 2, 3, 4]);
}

unsafe extern "C" fn greedy_local_memory_kernel(_output: *const c_void) {
    let lid = hc_local_linear_idx_get();
    if lid == 0 {
        let mut offset = 0u32;
        // twice the per-CPU local memory limit
        unsafe { hc_requisition_local_memory(128 * 1024, &mut offset) };
    }
    local_barrier();
}

#[test]
fn local_memory_overflow_aborts_the_dispatch() {
    init_logging();
    let output = HostBuffer::new(16 * 4);
    let kernel = HostKernel::from_host_function("greedy_local_memory_kernel",
                                                greedy_local_memory_kernel as *const c_void,
                                                None);
    let err = kernel
        .execute(1, UInt3::new(16, 1, 1), UInt3::new(16, 1, 1), &[KernelArg::Buffer(&output)],
                 None)
        .unwrap_err();
    assert!(matches!(&err, ExecError::LocalMemoryExceeded(name)
                     if name == "greedy_local_memory_kernel"));
}

unsafe extern "C" fn raw_value_kernel(output: *const c_void, bias: *const c_void) {
    let gid = hc_global_idx_get().x;
    unsafe {
        let bias = *(bias as *const u32);
        *(output as *mut u32).add(gid as usize) = gid + bias;
    }
}

#[test]
fn raw_value_arguments_are_passed_by_pointer() {
    init_logging();
    let output = HostBuffer::new(8 * 4);
    let bias = 100u32.to_ne_bytes();
    let kernel = HostKernel::from_host_function("raw_value_kernel",
                                                raw_value_kernel as *const c_void, None);
    kernel
        .execute(1, UInt3::new(8, 1, 1), UInt3::new(8, 1, 1),
                 &[KernelArg::Buffer(&output), KernelArg::Raw(&bias)], None)
        .unwrap();
    assert_eq!(output.to_u32_vec(), (100..108).collect::<Vec<u32>>());
}
