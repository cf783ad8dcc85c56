//! Host dispatcher: argument marshalling, work partitioning and the worker
//! thread pool.
//!
//! A dispatch is synchronous: workers are spawned, each pins itself to a CPU
//! and pulls group ids from an atomic ticket counter until the range is
//! exhausted, then everything joins and the completion callback runs. A
//! process-wide mutex serialises dispatches; concurrent kernel execution is
//! not supported.

use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use hcapi::limits::{LOCAL_MEMORY_SIZE, MAX_TOTAL_LOCAL_SIZE, SIMD_WIDTH};
use hcapi::{FunctionInfo, UInt3};
use hcmod_loader::{HostProgram, Instance};

use crate::buffer::HostBuffer;
use crate::exec::{self, KernelCall, SimdValue, run_device_group_item, run_host_group_item};
use crate::fiber::{FiberContext, InitFunc, run_exec};
use crate::printf;
use crate::runtime::{HostRuntime, set_thread_affinity};
use crate::{ExecError, Result};

/// One kernel argument, in declaration order.
pub enum KernelArg<'a> {
    Buffer(&'a HostBuffer),
    BufferArray(&'a [&'a HostBuffer]),
    /// Opaque image descriptor produced by the backend image layer.
    Image(*const c_void),
    ImageArray(&'a [*const c_void]),
    /// Storage buffer backing an argument buffer.
    ArgumentBuffer(&'a HostBuffer),
    /// Plain value argument; the kernel receives a pointer to these bytes.
    Raw(&'a [u8]),
}

enum KernelVariant {
    /// Kernel compiled into this process and called directly.
    Host { func: *const c_void },
    /// Kernel loaded from a Host-Compute ELF binary; every CPU calls into its
    /// own instance.
    Device { program: Arc<HostProgram> },
}

pub struct HostKernel {
    name: String,
    info: Option<FunctionInfo>,
    variant: KernelVariant,
}

// The function pointer is either a static host function or points into the
// RX pages of a loaded program that the kernel keeps alive.
unsafe impl Send for HostKernel {}
unsafe impl Sync for HostKernel {}

struct Geometry {
    global_dim: UInt3,
    local_dim: UInt3,
    group_dim: UInt3,
    work_dim: u32,
    local_size: u32,
    group_count: u32,
}

/// Per-dispatch state shared by all workers.
struct DispatchShared<'a> {
    function_name: &'a str,
    geometry: &'a Geometry,
    runtime: &'static HostRuntime,
    group_ticket: AtomicU32,
    running: AtomicBool,
    local_memory_exceeded: AtomicBool,
    barrier_misuse: AtomicBool,
    worker_error: Mutex<Option<ExecError>>,
}

impl DispatchShared<'_> {
    fn record_error(&self, err: ExecError) {
        self.running.store(false, Ordering::Release);
        let mut slot = self.worker_error.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

impl HostKernel {
    /// Kernel entry point that is statically linked into this process.
    pub fn from_host_function(name: impl Into<String>, func: *const c_void,
                              info: Option<FunctionInfo>) -> HostKernel {
        HostKernel { name: name.into(), info, variant: KernelVariant::Host { func } }
    }

    /// Kernel exported by a loaded Host-Compute program.
    pub fn from_program(name: impl Into<String>, program: Arc<HostProgram>,
                        info: Option<FunctionInfo>) -> Result<HostKernel> {
        let name = name.into();
        if !program.function_names().iter().any(|n| *n == name) {
            return Err(ExecError::MissingFunction(name));
        }
        Ok(HostKernel { name, info, variant: KernelVariant::Device { program } })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the kernel over `global_work_size` with `local_work_size`-sized
    /// work-groups. Blocks until all groups finished; `completion` is invoked
    /// exactly once after a successful join.
    pub fn execute(&self, work_dim: u32, global_work_size: UInt3, local_work_size: UInt3,
                   args: &[KernelArg<'_>], completion: Option<Box<dyn FnOnce() + '_>>)
        -> Result<()> {
        let (vptr_args, _array_holders) = marshal_args(args)?;
        let geometry = self.check_geometry(work_dim, global_work_size, local_work_size)?;
        let runtime = HostRuntime::try_get()?;

        let cpu_count = match &self.variant {
            KernelVariant::Host { .. } => runtime.max_thread_count(),
            KernelVariant::Device { program } => {
                let count = program.instance_count();
                if count > runtime.max_thread_count() {
                    return Err(ExecError::Geometry(
                        "device CPU count exceeds h/w thread count".into(),
                    ));
                }
                count
            }
        };

        // only a single kernel can be active/executed at one time
        let _dispatch_guard = runtime.lock_dispatch();

        let shared = DispatchShared {
            function_name: &self.name,
            geometry: &geometry,
            runtime,
            group_ticket: AtomicU32::new(0),
            running: AtomicBool::new(true),
            local_memory_exceeded: AtomicBool::new(false),
            barrier_misuse: AtomicBool::new(false),
            worker_error: Mutex::new(None),
        };

        match &self.variant {
            KernelVariant::Host { func } => {
                let func = *func;
                std::thread::scope(|scope| {
                    for cpu_idx in 0..cpu_count {
                        let call = KernelCall::new(func, vptr_args.clone());
                        let shared = &shared;
                        scope.spawn(move || host_worker(cpu_idx, call, shared));
                    }
                });
            }
            KernelVariant::Device { program } => {
                let printf_buffer = runtime.printf_buffer_ptr();
                printf::reset_if_dirty(printf_buffer);

                std::thread::scope(|scope| {
                    for cpu_idx in 0..cpu_count {
                        // the entry pointer is bound per instance inside the worker
                        let call = KernelCall::new(core::ptr::null(), vptr_args.clone());
                        let shared = &shared;
                        let program = program.as_ref();
                        scope.spawn(move || {
                            match program.instance(cpu_idx) {
                                Some(instance) => device_worker(cpu_idx, instance, call, shared),
                                None => shared.record_error(ExecError::MissingInstance(cpu_idx)),
                            }
                        });
                    }
                });

                if printf::has_output(printf_buffer) {
                    printf::drain(printf_buffer);
                }
            }
        }

        if let Some(err) = shared.worker_error.into_inner().unwrap_or_else(|p| p.into_inner()) {
            return Err(err);
        }
        if shared.local_memory_exceeded.load(Ordering::Acquire) {
            return Err(ExecError::LocalMemoryExceeded(self.name.clone()));
        }
        if shared.barrier_misuse.load(Ordering::Acquire) {
            return Err(ExecError::BarrierMisuse(self.name.clone()));
        }

        if let Some(completion) = completion {
            completion();
        }
        Ok(())
    }

    fn check_geometry(&self, work_dim: u32, global_work_size: UInt3, local_work_size: UInt3)
        -> Result<Geometry> {
        if !(1..=3).contains(&work_dim) {
            return Err(ExecError::Geometry(format!("invalid work dim: {work_dim}")));
        }
        if let Some(info) = &self.info {
            if !info.allows_local_size(&local_work_size) {
                return Err(ExecError::Geometry(format!(
                    "local work size {local_work_size} violates the required local size {}",
                    info.required_local_size
                )));
            }
        }
        let local_dim = local_work_size.maxed(1);
        let local_size = local_dim.linear();
        if local_size > MAX_TOTAL_LOCAL_SIZE as u64 {
            return Err(ExecError::Geometry(format!(
                "local work size {local_dim} exceeds the maximum total local size"
            )));
        }
        let global_dim = global_work_size.maxed(1);
        let group_dim = global_dim.ceil_div(&local_dim).maxed(1);
        Ok(Geometry {
            global_dim,
            local_dim,
            group_dim,
            work_dim,
            local_size: local_size as u32,
            group_count: group_dim.linear() as u32,
        })
    }
}

/// Flatten the argument list into the `const void*` vector the kernel ABI
/// expects. Array arguments are materialised into owned pointer blocks whose
/// lifetime spans the dispatch.
fn marshal_args<'a>(args: &[KernelArg<'a>])
    -> Result<(Vec<*const c_void>, Vec<Box<[*mut c_void]>>)> {
    let mut vptr_args: Vec<*const c_void> = Vec::with_capacity(args.len());
    let mut array_holders: Vec<Box<[*mut c_void]>> = Vec::new();
    for arg in args {
        match arg {
            KernelArg::Buffer(buffer) | KernelArg::ArgumentBuffer(buffer) => {
                vptr_args.push(buffer.as_ptr() as *const c_void);
            }
            KernelArg::BufferArray(buffers) => {
                let holder: Box<[*mut c_void]> =
                    buffers.iter().map(|b| b.as_ptr() as *mut c_void).collect();
                vptr_args.push(holder.as_ptr() as *const c_void);
                array_holders.push(holder);
            }
            KernelArg::Image(descriptor) => vptr_args.push(*descriptor),
            KernelArg::ImageArray(descriptors) => {
                let holder: Box<[*mut c_void]> =
                    descriptors.iter().map(|d| *d as *mut c_void).collect();
                vptr_args.push(holder.as_ptr() as *const c_void);
                array_holders.push(holder);
            }
            KernelArg::Raw(bytes) => vptr_args.push(bytes.as_ptr() as *const c_void),
        }
    }
    if vptr_args.len() > 32 {
        return Err(ExecError::TooManyArgs);
    }
    Ok((vptr_args, array_holders))
}

/// The per-worker fiber pool: one context per work-item plus the main
/// context, with stacks carved out of the process-wide stack arena.
struct FiberPool {
    main_ctx: Box<FiberContext>,
    items: Vec<FiberContext>,
}

impl FiberPool {
    fn new(cpu_idx: u32, local_size: u32, entry: InitFunc, runtime: &HostRuntime) -> FiberPool {
        let mut pool = FiberPool {
            main_ctx: Box::new(FiberContext::new_main()),
            items: (0..local_size).map(|_| FiberContext::new_main()).collect(),
        };
        let main_ptr: *mut FiberContext = &mut *pool.main_ctx;
        let items_ptr = pool.items.as_mut_ptr();
        for i in 0..local_size {
            // return continues with the next fiber, the last one returns to
            // the main context
            let exit_ctx = if i + 1 < local_size {
                unsafe { items_ptr.add(i as usize + 1) }
            } else {
                main_ptr
            };
            unsafe {
                (*items_ptr.add(i as usize)).init(
                    runtime.stack_base(cpu_idx, i, local_size),
                    entry,
                    i,
                    local_size,
                    exit_ctx,
                    main_ptr,
                );
            }
        }
        pool
    }

    fn reset_all(&mut self) {
        for item in &mut self.items {
            item.reset();
        }
    }
}

fn group_id_for(linear: u32, group_dim: UInt3) -> UInt3 {
    UInt3::new(linear % group_dim.x, (linear / group_dim.x) % group_dim.y,
               linear / (group_dim.x * group_dim.y))
}

/// Shared per-group loop: pull tickets, run the fiber pool, police barrier
/// misuse and local-memory exhaustion. `set_group_idx` publishes the group id
/// into the active id block, `state` borrows the worker's exec state.
fn group_loop(pool: &mut FiberPool, shared: &DispatchShared<'_>,
              set_group_idx: &mut dyn FnMut(UInt3)) {
    let geometry = shared.geometry;
    while shared.running.load(Ordering::Acquire) {
        let group_linear_idx = shared.group_ticket.fetch_add(1, Ordering::Relaxed);
        if group_linear_idx >= geometry.group_count {
            break;
        }
        let group_id = group_id_for(group_linear_idx, geometry.group_dim);
        set_group_idx(group_id);

        pool.reset_all();
        let state = exec::active_state();
        state.unfinished_items = geometry.local_size;

        run_exec(&mut pool.main_ctx, pool.items.as_ptr());

        let state = exec::active_state();
        if state.local_memory_exceeded {
            log::error!(
                "exceeded local memory allocation in function \"{}\" - requested {} bytes, limit is {} bytes",
                shared.function_name, state.local_memory_alloc_offset, LOCAL_MEMORY_SIZE
            );
            shared.local_memory_exceeded.store(true, Ordering::Release);
            shared.running.store(false, Ordering::Release);
            break;
        }
        if state.unfinished_items > 0 {
            log::error!(
                "barrier misuse detected in function \"{}\" - {} unfinished items in group {}",
                shared.function_name, state.unfinished_items, group_id
            );
            shared.barrier_misuse.store(true, Ordering::Release);
            shared.running.store(false, Ordering::Release);
            break;
        }
        if !pool.items.iter().all(|item| item.canary_intact()) {
            log::error!("fiber stack canary destroyed in function \"{}\"", shared.function_name);
            shared.running.store(false, Ordering::Release);
            break;
        }
    }
}

fn host_worker(cpu_idx: u32, call: KernelCall, shared: &DispatchShared<'_>) {
    set_thread_affinity(cpu_idx + 1);
    let geometry = shared.geometry;

    let ctx = exec::host_exec();
    ctx.ids.reset(geometry.global_dim, geometry.local_dim, geometry.group_dim, geometry.work_dim);
    ctx.state.linear_local_work_size = geometry.local_size;
    ctx.state.function = Some(call);
    ctx.state.local_memory_alloc_offset = 0;
    ctx.state.local_memory_exceeded = false;
    ctx.state.simd_storage =
        vec![SimdValue::default(); geometry.local_size.next_multiple_of(SIMD_WIDTH) as usize];
    ctx.local_memory_base = shared.runtime.local_memory_base();
    ctx.thread_local_memory_offset = shared.runtime.local_memory_offset(cpu_idx);

    let mut pool = FiberPool::new(cpu_idx, geometry.local_size, run_host_group_item,
                                  shared.runtime);
    ctx.state.item_contexts = pool.items.as_mut_ptr();
    exec::set_active_state(exec::ActiveState::Host);

    group_loop(&mut pool, shared, &mut |group_id| {
        exec::host_exec().ids.group_idx = group_id;
    });

    let ctx = exec::host_exec();
    ctx.state.function = None;
    ctx.state.item_contexts = core::ptr::null_mut();
}

fn device_worker(cpu_idx: u32, instance: &Instance, call: KernelCall,
                 shared: &DispatchShared<'_>) {
    set_thread_affinity(cpu_idx + 1);
    let geometry = shared.geometry;

    let Some(func) = instance.function(shared.function_name) else {
        log::error!("failed to find function \"{}\" for CPU #{}", shared.function_name, cpu_idx);
        shared.record_error(ExecError::MissingFunction(shared.function_name.to_string()));
        return;
    };

    instance.reset(geometry.local_dim * geometry.group_dim, geometry.local_dim,
                   geometry.group_dim, geometry.work_dim);

    let ctx = exec::device_exec();
    ctx.ids = instance.ids_ptr();
    ctx.state.linear_local_work_size = geometry.local_size;
    ctx.state.function = Some(call.with_function(func));
    ctx.state.simd_storage =
        vec![SimdValue::default(); geometry.local_size.next_multiple_of(SIMD_WIDTH) as usize];

    let mut pool = FiberPool::new(cpu_idx, geometry.local_size, run_device_group_item,
                                  shared.runtime);
    ctx.state.item_contexts = pool.items.as_mut_ptr();
    exec::set_active_state(exec::ActiveState::Device);

    let ids = instance.ids_ptr();
    group_loop(&mut pool, shared, &mut |group_id| {
        // SAFETY: this worker exclusively owns the instance for the dispatch.
        unsafe { (*ids).group_idx = group_id };
    });

    let ctx = exec::device_exec();
    ctx.state.function = None;
    ctx.state.item_contexts = core::ptr::null_mut();
    ctx.ids = core::ptr::null_mut();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_rounds_groups_up() {
        let kernel = HostKernel::from_host_function("k", core::ptr::null(), None);
        let g = kernel.check_geometry(1, UInt3::new(1000, 1, 1), UInt3::new(32, 1, 1)).unwrap();
        assert_eq!(g.group_dim, UInt3::new(32, 1, 1));
        assert_eq!(g.group_count, 32);
        assert_eq!(g.local_size, 32);
    }

    #[test]
    fn geometry_rejects_required_local_size_mismatch() {
        use hcapi::{FunctionFlags, FunctionType};
        let info = FunctionInfo {
            name: "k".into(),
            func_type: FunctionType::Kernel,
            flags: FunctionFlags::empty(),
            required_local_size: UInt3::new(32, 1, 1),
            required_simd_width: 0,
            args: Vec::new(),
        };
        let kernel = HostKernel::from_host_function("k", core::ptr::null(), Some(info));
        assert!(kernel.check_geometry(1, UInt3::new(64, 1, 1), UInt3::new(16, 1, 1)).is_err());
        assert!(kernel.check_geometry(1, UInt3::new(64, 1, 1), UInt3::new(32, 1, 1)).is_ok());
    }

    #[test]
    fn geometry_rejects_oversized_local_size() {
        let kernel = HostKernel::from_host_function("k", core::ptr::null(), None);
        assert!(kernel.check_geometry(1, UInt3::new(4096, 1, 1), UInt3::new(2048, 1, 1)).is_err());
    }

    #[test]
    fn marshalling_rejects_more_than_32_args() {
        let raw = [0u8; 4];
        let args: Vec<KernelArg<'_>> = (0..33).map(|_| KernelArg::Raw(&raw)).collect();
        assert!(matches!(marshal_args(&args), Err(ExecError::TooManyArgs)));
    }

    #[test]
    fn group_id_linearisation() {
        let dim = UInt3::new(4, 2, 2);
        assert_eq!(group_id_for(0, dim), UInt3::new(0, 0, 0));
        assert_eq!(group_id_for(5, dim), UInt3::new(1, 1, 0));
        assert_eq!(group_id_for(15, dim), UInt3::new(3, 1, 1));
    }
}
