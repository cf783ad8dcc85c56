//! Process-wide runtime state.
//!
//! The fiber stacks, the local-memory arena and the printf buffer are shared
//! by all dispatches and sized for the maximum hardware thread count, so they
//! are allocated once and owned by a single lazily initialised handle instead
//! of loose globals.

use core::ffi::c_void;
use std::sync::{Mutex, MutexGuard, OnceLock};

use hcapi::limits::{FIBER_STACK_SIZE, LOCAL_MEMORY_SIZE, MAX_TOTAL_LOCAL_SIZE,
                    PRINTF_BUFFER_SIZE};
use hcmod_loader::{PinnedArena, RuntimeSymbols};

use crate::printf;
use crate::{ExecError, Result};

pub struct HostRuntime {
    max_thread_count: u32,
    /// One `FIBER_STACK_SIZE` stack per (cpu, work-item) pair, aligned to the
    /// stack size so the stack-pointer context lookup works.
    stack_arena: PinnedArena,
    /// One `LOCAL_MEMORY_SIZE` slice per CPU.
    local_memory_arena: PinnedArena,
    printf_buffer: PinnedArena,
    /// Serialises dispatches; only one kernel runs at a time.
    dispatch_lock: Mutex<()>,
}

static RUNTIME: OnceLock<HostRuntime> = OnceLock::new();

impl HostRuntime {
    pub fn try_get() -> Result<&'static HostRuntime> {
        if let Some(runtime) = RUNTIME.get() {
            return Ok(runtime);
        }
        let runtime = HostRuntime::new()?;
        Ok(RUNTIME.get_or_init(|| runtime))
    }

    fn new() -> Result<HostRuntime> {
        let max_thread_count = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .map_err(|e| ExecError::Runtime(format!("failed to query CPU count: {e}")))?;

        let stack_bytes =
            max_thread_count as usize * MAX_TOTAL_LOCAL_SIZE as usize * FIBER_STACK_SIZE;
        let stack_arena = PinnedArena::alloc_unpinned(stack_bytes, FIBER_STACK_SIZE)
            .map_err(|e| ExecError::Runtime(format!("stack arena allocation failed: {e}")))?;

        let local_memory_arena =
            PinnedArena::alloc_unpinned(max_thread_count as usize * LOCAL_MEMORY_SIZE, 4096)
                .map_err(|e| {
                    ExecError::Runtime(format!("local memory arena allocation failed: {e}"))
                })?;

        let printf_buffer = PinnedArena::alloc_unpinned(PRINTF_BUFFER_SIZE as usize, 4096)
            .map_err(|e| ExecError::Runtime(format!("printf buffer allocation failed: {e}")))?;
        printf::init(printf_buffer.as_ptr() as *mut u32);

        Ok(HostRuntime {
            max_thread_count,
            stack_arena,
            local_memory_arena,
            printf_buffer,
            dispatch_lock: Mutex::new(()),
        })
    }

    pub fn max_thread_count(&self) -> u32 {
        self.max_thread_count
    }

    /// Stack base for work-item `item_idx` of the worker pinned to `cpu_idx`.
    pub(crate) fn stack_base(&self, cpu_idx: u32, item_idx: u32, local_size: u32) -> *mut u8 {
        debug_assert!(cpu_idx < self.max_thread_count);
        debug_assert!(item_idx < local_size && local_size <= MAX_TOTAL_LOCAL_SIZE);
        let slot = (item_idx + local_size * cpu_idx) as usize;
        unsafe { (self.stack_arena.as_ptr() as *mut u8).add(slot * FIBER_STACK_SIZE) }
    }

    pub(crate) fn local_memory_base(&self) -> *mut u8 {
        self.local_memory_arena.as_ptr() as *mut u8
    }

    pub(crate) fn local_memory_offset(&self, cpu_idx: u32) -> u32 {
        cpu_idx * LOCAL_MEMORY_SIZE as u32
    }

    pub(crate) fn printf_buffer_ptr(&self) -> *mut u32 {
        self.printf_buffer.as_ptr() as *mut u32
    }

    pub(crate) fn lock_dispatch(&self) -> MutexGuard<'_, ()> {
        self.dispatch_lock.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Pin the calling thread to one CPU. Index 0 means "no affinity",
/// `cpu_idx + 1` pins to that CPU; this keeps workers from migrating between
/// CPUs mid-group.
pub(crate) fn set_thread_affinity(affinity_idx: u32) {
    if affinity_idx == 0 {
        return;
    }
    #[cfg(target_os = "linux")]
    unsafe {
        let cpu = affinity_idx as usize - 1;
        let mut set: libc::cpu_set_t = core::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set) != 0 {
            log::warn!("failed to set thread affinity to CPU {cpu}");
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        // No portable affinity API elsewhere; scheduling hints only.
        let _ = affinity_idx;
    }
}

/// Runtime symbol table handed to the loader: device binaries import the
/// barrier/SIMD/printf entry points by name.
pub struct ExecSymbols;

impl RuntimeSymbols for ExecSymbols {
    fn resolve(&self, name: &str) -> Option<*const c_void> {
        use crate::exec;

        macro_rules! table {
            ($($sym:ident),* $(,)?) => {
                match name {
                    $(stringify!($sym) => Some(exec::$sym as *const c_void),)*
                    _ => None,
                }
            };
        }
        table!(
            hc_device_barrier,
            hc_device_simd_barrier,
            hc_device_printf_buffer,
            hc_device_simd_ballot,
            hc_device_simd_shuffle_u32,
            hc_device_simd_shuffle_down_u32,
            hc_device_simd_shuffle_up_u32,
            hc_device_simd_shuffle_xor_u32,
            hc_device_simd_shuffle_i32,
            hc_device_simd_shuffle_down_i32,
            hc_device_simd_shuffle_up_i32,
            hc_device_simd_shuffle_xor_i32,
            hc_device_simd_shuffle_f32,
            hc_device_simd_shuffle_down_f32,
            hc_device_simd_shuffle_up_f32,
            hc_device_simd_shuffle_xor_f32,
            global_mem_fence,
            global_read_mem_fence,
            global_write_mem_fence,
            local_mem_fence,
            local_read_mem_fence,
            local_write_mem_fence,
            image_mem_fence,
            image_read_mem_fence,
            image_write_mem_fence,
        )
    }
}
