//! Cooperative fiber contexts.
//!
//! A fiber context is a callee-saved register save area plus a 16 KiB stack.
//! The context-switch trampolines are file-scope assembly; the Rust struct
//! layout below is ABI with them, so every field the assembly touches has its
//! offset asserted at compile time.
//!
//! Stack layout, established once at init time: the topmost 64-bit slot
//! (`stack_top - 8`) holds the owning context's address, which is what makes
//! [`current_context`] possible, and the slot below it holds a canary.

use hcapi::UInt3;
use hcapi::limits::{FIBER_STACK_SIZE, SIMD_WIDTH};

pub const FIBER_CONTEXT_ALIGNMENT: usize = 256;
pub const STACK_CANARY: u64 = 0x0123_4567_89AB_CDEF;

pub type InitFunc = unsafe extern "C" fn(u32);

/// SysV x86-64 callee-saved register file plus stack/instruction pointers.
#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Default)]
struct RegisterFile {
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    sp: u64,
    ip: u64,
}

/// AAPCS64 callee-saved register file (x19-x28, fp, low halves of d8-d15)
/// plus stack/instruction pointers.
#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Default)]
struct RegisterFile {
    x19: u64,
    x20: u64,
    x21: u64,
    x22: u64,
    x23: u64,
    x24: u64,
    x25: u64,
    x26: u64,
    x27: u64,
    x28: u64,
    fp: u64,
    d8: u64,
    d9: u64,
    d10: u64,
    d11: u64,
    d12: u64,
    d13: u64,
    d14: u64,
    d15: u64,
    sp: u64,
    ip: u64,
}

#[repr(C, align(256))]
pub struct FiberContext {
    regs: RegisterFile,
    stack_ptr: *mut u8,
    pub sub_group_idx: u32,
    pub sub_group_local_idx: u32,
    // Fields below are read by the enter trampoline; do not reorder.
    init_func: Option<InitFunc>,
    exit_ctx: *mut FiberContext,
    main_ctx: *mut FiberContext,
    pub local_linear_idx: u32,
    pub global_idx: UInt3,
    pub local_idx: UInt3,
    /// Index of the fiber a work-group barrier swaps to.
    pub next_linear_ctx_idx: u32,
    /// Index of the fiber a SIMD barrier swaps to (next lane in the sub-group).
    pub next_simd_ctx_idx: u32,
}

#[cfg(target_arch = "x86_64")]
const REGS_SIZE: usize = 0x40;
#[cfg(target_arch = "aarch64")]
const REGS_SIZE: usize = 0xA8;

// The trampolines hard-code these offsets.
const _: () = {
    assert!(size_of::<RegisterFile>() == REGS_SIZE);
    assert!(core::mem::offset_of!(FiberContext, stack_ptr) == REGS_SIZE);
    assert!(core::mem::offset_of!(FiberContext, init_func) == REGS_SIZE + 0x10);
    assert!(core::mem::offset_of!(FiberContext, exit_ctx) == REGS_SIZE + 0x18);
    assert!(core::mem::offset_of!(FiberContext, main_ctx) == REGS_SIZE + 0x20);
    assert!(core::mem::offset_of!(FiberContext, local_linear_idx) == REGS_SIZE + 0x28);
    assert!(size_of::<FiberContext>() <= FIBER_CONTEXT_ALIGNMENT);
    assert!(FIBER_STACK_SIZE.is_power_of_two());
};

#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    r#"
    .global hc_get_context
    hc_get_context:
        mov qword ptr [rdi + 0x00], rbp
        mov qword ptr [rdi + 0x08], rbx
        mov qword ptr [rdi + 0x10], r12
        mov qword ptr [rdi + 0x18], r13
        mov qword ptr [rdi + 0x20], r14
        mov qword ptr [rdi + 0x28], r15
        lea rcx, [rsp + 8]
        mov qword ptr [rdi + 0x30], rcx
        mov rcx, qword ptr [rsp]
        mov qword ptr [rdi + 0x38], rcx
        ret

    .global hc_set_context
    hc_set_context:
        mov rcx, qword ptr [rdi + 0x38]
        mov rsp, qword ptr [rdi + 0x30]
        mov r15, qword ptr [rdi + 0x28]
        mov r14, qword ptr [rdi + 0x20]
        mov r13, qword ptr [rdi + 0x18]
        mov r12, qword ptr [rdi + 0x10]
        mov rbx, qword ptr [rdi + 0x08]
        mov rbp, qword ptr [rdi + 0x00]
        jmp rcx

    .global hc_enter_context
    hc_enter_context:
        mov rax, qword ptr [rsp + 8]
        mov rcx, qword ptr [rax + 0x50]
        mov edi, dword ptr [rax + 0x68]
        call rcx
        mov rax, qword ptr [rsp + 8]
        mov rdi, qword ptr [rax + 0x58]
        call hc_set_context
        ud2
    "#
);

#[cfg(target_arch = "aarch64")]
core::arch::global_asm!(
    r#"
    .global hc_get_context
    hc_get_context:
        stp x19, x20, [x0]
        stp x21, x22, [x0, #16]
        stp x23, x24, [x0, #32]
        stp x25, x26, [x0, #48]
        stp x27, x28, [x0, #64]
        str x29, [x0, #80]
        stp d8, d9, [x0, #88]
        stp d10, d11, [x0, #104]
        stp d12, d13, [x0, #120]
        stp d14, d15, [x0, #136]
        mov x9, sp
        stp x9, x30, [x0, #152]
        ret

    .global hc_set_context
    hc_set_context:
        ldp x9, x30, [x0, #152]
        ldp d14, d15, [x0, #136]
        ldp d12, d13, [x0, #120]
        ldp d10, d11, [x0, #104]
        ldp d8, d9, [x0, #88]
        ldp x28, x29, [x0, #72]
        ldp x26, x27, [x0, #56]
        ldp x24, x25, [x0, #40]
        ldp x22, x23, [x0, #24]
        ldp x20, x21, [x0, #8]
        ldr x19, [x0]
        mov sp, x9
        br x30

    .global hc_enter_context
    hc_enter_context:
        ldr x9, [sp, #8]
        ldr x10, [x9, #184]
        ldr w0, [x9, #208]
        blr x10
        ldr x9, [sp, #8]
        ldr x0, [x9, #192]
        bl hc_set_context
        udf #0
    "#
);

unsafe extern "C" {
    fn hc_get_context(ctx: *mut FiberContext);
    fn hc_set_context(ctx: *const FiberContext) -> !;
    fn hc_enter_context();
}

impl FiberContext {
    /// A bare register save area; used for the per-worker main context and as
    /// the initial state of each work-item fiber before `init`.
    pub fn new_main() -> FiberContext {
        FiberContext {
            regs: RegisterFile::default(),
            stack_ptr: core::ptr::null_mut(),
            sub_group_idx: 0,
            sub_group_local_idx: 0,
            init_func: None,
            exit_ctx: core::ptr::null_mut(),
            main_ctx: core::ptr::null_mut(),
            local_linear_idx: !0,
            global_idx: UInt3::zero(),
            local_idx: UInt3::zero(),
            next_linear_ctx_idx: 0,
            next_simd_ctx_idx: 0,
        }
    }

    /// Wire up a work-item fiber: its stack, entry function and the swap
    /// chain (return continues with the next fiber, the last one returns to
    /// the main context).
    ///
    /// # Safety
    /// `stack_ptr` must point at a live, exclusively owned stack of
    /// `FIBER_STACK_SIZE` bytes, aligned to `FIBER_STACK_SIZE`.
    pub unsafe fn init(&mut self, stack_ptr: *mut u8, init_func: InitFunc,
                       local_linear_idx: u32, local_size: u32, exit_ctx: *mut FiberContext,
                       main_ctx: *mut FiberContext) {
        assert_eq!(self as *const _ as usize % FIBER_CONTEXT_ALIGNMENT, 0,
                   "fiber context must be {FIBER_CONTEXT_ALIGNMENT}-byte aligned");
        assert_eq!(stack_ptr as usize % FIBER_STACK_SIZE, 0,
                   "stack must be {FIBER_STACK_SIZE}-byte aligned");

        self.stack_ptr = stack_ptr;
        self.init_func = Some(init_func);
        self.exit_ctx = exit_ctx;
        self.main_ctx = main_ctx;
        self.local_linear_idx = local_linear_idx;

        self.next_linear_ctx_idx = (local_linear_idx + 1) % local_size;
        let next_lane_idx = ((local_linear_idx % SIMD_WIDTH) + 1) % SIMD_WIDTH;
        self.next_simd_ctx_idx = (local_linear_idx & !(SIMD_WIDTH - 1)) + next_lane_idx;

        // Top of stack: context back-pointer and canary. Written once, not on
        // every reset; a kernel that overwrites them has already lost.
        unsafe {
            let stack_top = stack_ptr.add(FIBER_STACK_SIZE) as *mut u64;
            *stack_top.sub(1) = self as *const _ as u64;
            *stack_top.sub(2) = STACK_CANARY;
        }
    }

    /// Rewind the fiber to its entry trampoline for the next work-group.
    /// No-op on contexts without a stack (the main context).
    pub fn reset(&mut self) {
        if self.stack_ptr.is_null() {
            return;
        }
        self.regs = RegisterFile::default();
        // Two 64-bit values live above sp; sp itself stays 16-byte aligned.
        self.regs.sp = self.stack_ptr as u64 + FIBER_STACK_SIZE as u64 - 16;
        self.regs.ip = hc_enter_context as usize as u64;
        unsafe {
            *((self.regs.sp + 8) as *mut u64) = self as *const _ as u64;
            *(self.regs.sp as *mut u64) = STACK_CANARY;
        }
    }

    pub fn canary_intact(&self) -> bool {
        if self.stack_ptr.is_null() {
            return true;
        }
        unsafe {
            let stack_top = self.stack_ptr.add(FIBER_STACK_SIZE) as *const u64;
            *stack_top.sub(2) == STACK_CANARY
        }
    }

    #[inline(never)]
    pub fn get_context(&mut self) {
        unsafe { hc_get_context(self) };
    }

    #[inline(never)]
    pub fn set_context(&self) -> ! {
        unsafe { hc_set_context(self) };
    }

    /// Save the current point of execution into `self` and resume `next`.
    /// Returns when some other fiber swaps back to `self`.
    #[inline(never)]
    pub fn swap_context(&mut self, next: *const FiberContext) {
        // The volatile flag distinguishes the first return of get_context
        // (fall through and leave) from the resume-after-swap return.
        let mut swapped = false;
        let swapped_ptr = &raw mut swapped;
        self.get_context();
        if !unsafe { core::ptr::read_volatile(swapped_ptr) } {
            unsafe { core::ptr::write_volatile(swapped_ptr, true) };
            unsafe { (*next).set_context() };
        }
    }

    pub fn exit_to_main(&mut self) {
        let main_ctx = self.main_ctx;
        self.swap_context(main_ctx);
    }
}

/// Recover the running fiber's context record from the stack pointer.
///
/// Stacks are `FIBER_STACK_SIZE`-aligned, so rounding the stack pointer up to
/// the next stack boundary finds `stack_top`, below which the back-pointer
/// was placed at init time. Only valid while running on a fiber stack.
pub fn current_context() -> *mut FiberContext {
    let sp: u64;
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!("mov {}, rsp", out(reg) sp)
    };
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("mov {}, sp", out(reg) sp)
    };
    let stack_top = (sp + FIBER_STACK_SIZE as u64 - 1) & !(FIBER_STACK_SIZE as u64 - 1);
    unsafe { *((stack_top as *const u64).sub(1)) as *mut FiberContext }
}

/// Transfer control into the first fiber of a work-group and block until the
/// fiber chain returns to `main_ctx`.
#[inline(never)]
pub fn run_exec(main_ctx: &mut FiberContext, first_item: *const FiberContext) {
    let mut done = false;
    let done_ptr = &raw mut done;
    main_ctx.get_context();
    if !unsafe { core::ptr::read_volatile(done_ptr) } {
        unsafe { core::ptr::write_volatile(done_ptr, true) };
        unsafe { (*first_item).set_context() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_record_is_small_enough() {
        assert!(size_of::<FiberContext>() <= FIBER_CONTEXT_ALIGNMENT);
        assert_eq!(align_of::<FiberContext>(), FIBER_CONTEXT_ALIGNMENT);
    }
}
