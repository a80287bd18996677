//! Minimal execution-context save/restore.
//!
//! This is the crate's one unsafe boundary with the hardware: a switch saves
//! the callee-saved registers of the current thread of execution on its own
//! stack, parks the stack pointer in the outgoing [`Context`], and resumes
//! from the stack pointer held by the incoming one. A freshly prepared
//! context "resumes" into a trampoline that loads the fiber pointer from a
//! callee-saved register and enters `weft_fiber_main` (defined in the fiber
//! module), so entering a fiber needs no global state at all.
//!
//! Caller-saved registers need no treatment: from the compiler's point of
//! view `weft_ctx_switch` is an ordinary C call.

use std::ffi::c_void;

use super::stack::FiberStack;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("weft supports x86_64 and aarch64 only");

/// Saved execution context: the stack pointer of a suspended fiber (or
/// thread), with all callee-saved state spilled beneath it.
#[repr(C)]
pub(crate) struct Context {
    sp: *mut u8,
}

impl Context {
    pub(crate) const fn null() -> Self {
        Self {
            sp: std::ptr::null_mut(),
        }
    }
}

extern "C" {
    fn weft_ctx_switch(save: *mut *mut u8, load: *const *mut u8);
    fn weft_fiber_entry();
}

/// Switch execution from `from` to `to`.
///
/// # Safety
///
/// `from` and `to` must point to live contexts; `to` must hold either a
/// stack pointer previously saved by this function or one built by
/// [`prepare`]; and no other thread may touch either context for the
/// duration of the switch.
pub(crate) unsafe fn switch(from: *mut Context, to: *const Context) {
    weft_ctx_switch(from.cast::<*mut u8>(), to.cast::<*mut u8>());
}

/// Build the initial context for a fresh fiber: a fabricated switch frame on
/// `stack` that resumes into the entry trampoline with `arg` (the fiber
/// pointer) in a callee-saved register.
///
/// # Safety
///
/// `stack` must stay alive for as long as the returned context can be
/// switched to, and `arg` must remain valid until the fiber finishes.
#[cfg(target_arch = "x86_64")]
pub(crate) unsafe fn prepare(stack: &FiberStack, arg: *mut c_void) -> Context {
    let top = (stack.top() as usize) & !15;
    // Frame layout matches the restore path of weft_ctx_switch:
    // [r15][r14][r13][r12][rbx][rbp][return address]
    let sp = (top - 7 * 8) as *mut usize;
    for i in 0..7 {
        sp.add(i).write(0);
    }
    sp.add(3).write(arg as usize); // popped into r12
    sp.add(6).write(weft_fiber_entry as usize);
    Context { sp: sp.cast() }
}

/// Build the initial context for a fresh fiber (aarch64 variant).
///
/// # Safety
///
/// Same contract as the x86_64 version.
#[cfg(target_arch = "aarch64")]
pub(crate) unsafe fn prepare(stack: &FiberStack, arg: *mut c_void) -> Context {
    let top = (stack.top() as usize) & !15;
    // Frame layout matches the restore path of weft_ctx_switch:
    // x19..x28, x29, x30, d8..d15: twenty 8-byte slots.
    let sp = (top - 20 * 8) as *mut usize;
    for i in 0..20 {
        sp.add(i).write(0);
    }
    sp.add(0).write(arg as usize); // loaded into x19
    sp.add(11).write(weft_fiber_entry as usize); // loaded into x30
    Context { sp: sp.cast() }
}

#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    r#"
    .text
    .globl weft_ctx_switch
    .type weft_ctx_switch, @function
weft_ctx_switch:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    mov [rdi], rsp
    mov rsp, [rsi]
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret
    .size weft_ctx_switch, . - weft_ctx_switch

    .globl weft_fiber_entry
    .type weft_fiber_entry, @function
weft_fiber_entry:
    mov rdi, r12
    call weft_fiber_main
    ud2
    .size weft_fiber_entry, . - weft_fiber_entry
"#
);

#[cfg(target_arch = "aarch64")]
std::arch::global_asm!(
    r#"
    .text
    .globl weft_ctx_switch
    .type weft_ctx_switch, @function
weft_ctx_switch:
    sub sp, sp, #160
    stp x19, x20, [sp, #0]
    stp x21, x22, [sp, #16]
    stp x23, x24, [sp, #32]
    stp x25, x26, [sp, #48]
    stp x27, x28, [sp, #64]
    stp x29, x30, [sp, #80]
    stp d8, d9, [sp, #96]
    stp d10, d11, [sp, #112]
    stp d12, d13, [sp, #128]
    stp d14, d15, [sp, #144]
    mov x2, sp
    str x2, [x0]
    ldr x2, [x1]
    mov sp, x2
    ldp x19, x20, [sp, #0]
    ldp x21, x22, [sp, #16]
    ldp x23, x24, [sp, #32]
    ldp x25, x26, [sp, #48]
    ldp x27, x28, [sp, #64]
    ldp x29, x30, [sp, #80]
    ldp d8, d9, [sp, #96]
    ldp d10, d11, [sp, #112]
    ldp d12, d13, [sp, #128]
    ldp d14, d15, [sp, #144]
    add sp, sp, #160
    ret
    .size weft_ctx_switch, . - weft_ctx_switch

    .globl weft_fiber_entry
    .type weft_fiber_entry, @function
weft_fiber_entry:
    mov x0, x19
    bl weft_fiber_main
    brk #0
    .size weft_fiber_entry, . - weft_fiber_entry
"#
);
