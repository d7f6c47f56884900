//! Calling-convention adapter: the raw register-transfer paths.
//!
//! Everything here is a fixed-layout contract between the assembly and
//! the Rust types; the rest of the crate treats it as an opaque ABI
//! boundary and never depends on raw offsets directly.
//!
//! Layout contract (32-bit ARM):
//!
//! - `ThreadControl`: current frame pointer at +0x00, parked exit SP at
//!   +0x04. The block's address is published in the user-writable thread
//!   register (TPIDRURW) so the dispatcher can find it without touching
//!   guest register state.
//! - `SyscallFrame`: `r0..r12` +0x00, `pc` +0x34, `sp` +0x38, `lr` +0x3c,
//!   `cpsr` +0x40, `restore_flags` +0x44, `fpscr` +0x48, `prev_frame`
//!   +0x4c, `service_table` +0x50, `d0..d31` +0x60; 0x160 bytes total.
//! - `ContinuationSave`: cookie +0x00, `r4..r11` +0x04, `sp` +0x24, `pc`
//!   +0x28, `fpscr` +0x2c, `d8..d15` +0x30; 0x70 bytes.
//! - `CpuContext`: `flags` +0x00, `r0..r12` +0x04, `sp` +0x38, `lr`
//!   +0x3c, `pc` +0x40, `cpsr` +0x44, `fpscr` +0x48, `d` +0x50.
//!
//! Service-call entry contract: guest-side stubs home the four argument
//! registers at `[sp..sp+0x10]`, copy the return address into `r3`, load
//! the packed service id into `ip`, and branch (not call) to the
//! dispatcher.

#[cfg(all(target_arch = "arm", target_os = "linux"))]
use crate::continuation::ContinuationSave;
#[cfg(target_arch = "arm")]
use crate::context::CpuContext;
#[cfg(all(target_arch = "arm", target_os = "linux"))]
use crate::frame::SyscallFrame;
use crate::thread::ThreadControl;

#[cfg(target_arch = "arm")]
const _: () = {
    assert!(core::mem::offset_of!(CpuContext, sp) == 0x38);
    assert!(core::mem::offset_of!(CpuContext, lr) == 0x3c);
    assert!(core::mem::offset_of!(CpuContext, pc) == 0x40);
    assert!(core::mem::offset_of!(CpuContext, d) == 0x50);
};

/// Publish the thread-control address for the dispatcher's register-free
/// lookup path.
#[cfg(all(target_arch = "arm", target_os = "linux"))]
pub(crate) fn publish_thread_control(control: &ThreadControl) {
    unsafe {
        core::arch::asm!(
            "mcr p15, 0, {0}, c13, c0, 2",
            in(reg) control as *const ThreadControl,
            options(nostack, preserves_flags),
        );
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "linux")))]
pub(crate) fn publish_thread_control(_control: &ThreadControl) {}

#[cfg(all(target_arch = "arm", target_os = "linux"))]
unsafe extern "C" {
    /// Service-call entry; reached per the stub contract above.
    pub(crate) fn veneer_service_dispatcher() -> !;

    /// Jump into the dispatcher's register-restore epilogue: restores the
    /// guest image from `frame` with `status` in r0.
    pub(crate) fn veneer_dispatcher_return(frame: *mut SyscallFrame, status: u32) -> !;

    /// Capture native state; returns 0 falling through, the resume value
    /// otherwise.
    #[link_name = "veneer_cont_mark"]
    pub(crate) fn cont_mark(save: *mut ContinuationSave) -> u32;

    /// Transfer to a captured point, discarding the native stack above it.
    #[link_name = "veneer_cont_resume"]
    pub(crate) fn cont_resume(save: *const ContinuationSave, value: u32) -> !;

    fn veneer_raise_trampoline();

    /// Park the native SP for exit, switch to the root frame and enter
    /// the thread bootstrap body.
    pub(crate) fn veneer_start_thread(entry: u32, arg: u32, suspend: u32, guest_stack: u32) -> !;

    /// Restore the parked native SP and tail into `exit_fn(code)`.
    pub(crate) fn veneer_exit_thread(code: u32, exit_fn: unsafe extern "C" fn(u32) -> !) -> !;
}

/// Address of the guest-facing service-call entry, for stub generation.
#[cfg(all(target_arch = "arm", target_os = "linux"))]
pub(crate) fn service_dispatcher_addr() -> usize {
    veneer_service_dispatcher as usize
}

/// Address the faulted context is pointed at by `raise_guest_exception`;
/// the unwinder special-cases frames established here.
#[cfg(all(target_arch = "arm", target_os = "linux"))]
pub(crate) fn raise_trampoline_addr() -> usize {
    veneer_raise_trampoline as usize
}

#[cfg(not(all(target_arch = "arm", target_os = "linux")))]
mod stubs {
    /// Stand-in symbols so the portable layers (and their tests) have
    /// stable addresses to compare against.
    fn trampoline_placeholder() {}
    fn dispatcher_placeholder() {}

    pub(crate) fn raise_trampoline_addr() -> usize {
        trampoline_placeholder as usize
    }

    pub(crate) fn service_dispatcher_addr() -> usize {
        dispatcher_placeholder as usize
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "linux")))]
pub(crate) use stubs::{raise_trampoline_addr, service_dispatcher_addr};

#[cfg(all(target_arch = "arm", target_os = "linux"))]
core::arch::global_asm!(
    r#"
    .text
    .arm

/* Service-call entry. Saves the guest image into the current frame,
   switches to the service stack, marshals arguments and invokes the
   operation body; the epilogue at 4: writes back only the register
   groups flagged for restore. */
    .p2align 2
    .globl veneer_service_dispatcher
    .type veneer_service_dispatcher, %function
veneer_service_dispatcher:
    mrc p15, 0, r1, c13, c0, 2      /* thread control block */
    ldr r1, [r1]                    /* current syscall frame */
    add r0, r1, #0x10
    stm r0, {{r4-r12,lr}}           /* callee-saved + resume pc */
    add r2, sp, #0x10
    str r2, [r1, #0x38]             /* caller sp (above the homed args) */
    str r3, [r1, #0x3c]             /* caller lr */
    mrs r0, CPSR
    bfi r0, lr, #5, #1              /* encoding state from resume pc */
    str r0, [r1, #0x40]
    mov r0, #0
    str r0, [r1, #0x44]             /* clear restore mask */
    vmrs r0, fpscr
    str r0, [r1, #0x48]
    add r0, r1, #0x60
    vstm r0, {{d0-d15}}
    mov r6, sp                      /* homed argument words */
    mov sp, r1                      /* run the body on the service stack */
    mov r8, r1
    ldr r5, [r1, #0x50]             /* service table set */
    ubfx r4, ip, #12, #2            /* table selector */
    bfc ip, #12, #20                /* entry index */
    add r4, r5, r4, lsl #4
    ldr r5, [r4, #8]                /* table limit */
    cmp ip, r5
    bcs 5f
    ldr r5, [r4, #12]               /* argument size array */
    ldrb r5, [r5, ip]
    cmp r5, #16
    movle r5, #16                   /* at least the four homed words */
    sub r0, sp, r5
    bic r0, r0, #7                  /* spill area, 8-aligned */
    mov sp, r0
2:  subs r5, r5, #4
    ldr r0, [r6, r5]
    str r0, [sp, r5]
    bgt 2b
    pop {{r0-r3}}                   /* first four arguments */
    ldr r5, [r4]                    /* entry array */
    ldr ip, [r5, ip, lsl #2]
    blx ip
4:  ldr ip, [r8, #0x44]             /* restore mask */
    tst ip, #4                      /* FP group */
    beq 3f
    ldr r4, [r8, #0x48]
    vmsr fpscr, r4
    add r4, r8, #0x60
    vldm r4, {{d0-d15}}
3:  tst ip, #2                      /* integer group */
    ldmne r8, {{r0-r3}}
    ldr lr, [r8, #0x3c]
    ldr sp, [r8, #0x38]
    add r8, r8, #0x10
    ldm r8, {{r4-r12,pc}}
5:  movw r0, #0x000d                /* invalid-parameter status */
    movt r0, #0xc000
    b 4b
    .size veneer_service_dispatcher, . - veneer_service_dispatcher

/* Enter the restore epilogue directly: r0 = frame, r1 = status. */
    .p2align 2
    .globl veneer_dispatcher_return
    .type veneer_dispatcher_return, %function
veneer_dispatcher_return:
    mov r8, r0
    mov r0, r1
    b 4b
    .size veneer_dispatcher_return, . - veneer_dispatcher_return

/* Hand a faulted context to the guest exception dispatcher.
   r0 = &record, r1 = &context, r2 = dispatcher entry, lr = faulting pc.
   The original sp and lr are stored below the transfer block so the
   unwinder can recover both (it cannot restore pc and lr to two
   different values in one step). */
    .p2align 2
    .globl veneer_raise_trampoline
    .type veneer_raise_trampoline, %function
veneer_raise_trampoline:
    .cfi_startproc
    push {{r12,lr}}                 /* pad + faulting pc */
    ldr r3, [r1, #0x38]             /* context sp */
    push {{r3}}
    .cfi_escape 0x0f,0x03,0x7d,0x04,0x06   /* CFA: [sp + 4] */
    .cfi_escape 0x10,0x0e,0x02,0x7d,0x0c   /* lr: [sp + 0xc] */
    ldr r3, [r1, #0x3c]             /* context lr */
    push {{r3}}
    blx r2
    udf #0                          /* the dispatcher never returns */
    .cfi_endproc
    .size veneer_raise_trampoline, . - veneer_raise_trampoline

/* Capture native state into a ContinuationSave. Returns 0 on capture;
   a resume makes this return the resume value instead. */
    .p2align 2
    .globl veneer_cont_mark
    .type veneer_cont_mark, %function
veneer_cont_mark:
    mov r1, #0
    stm r0, {{r1,r4-r11}}           /* cookie + callee-saved */
    str sp, [r0, #0x24]
    str lr, [r0, #0x28]
    vmrs r2, fpscr
    str r2, [r0, #0x2c]
    add r0, r0, #0x30
    vstm r0, {{d8-d15}}
    mov r0, #0
    bx lr
    .size veneer_cont_mark, . - veneer_cont_mark

/* Resume a captured point with r1 as the capture site's return value. */
    .p2align 2
    .globl veneer_cont_resume
    .type veneer_cont_resume, %function
veneer_cont_resume:
    ldm r0, {{r3-r11}}              /* cookie (discarded) + callee-saved */
    ldr sp, [r0, #0x24]
    ldr r2, [r0, #0x28]
    ldr r3, [r0, #0x2c]
    vmsr fpscr, r3
    add r0, r0, #0x30
    vldm r0, {{d8-d15}}
    mov r0, r1
    bx r2
    .size veneer_cont_resume, . - veneer_cont_resume

/* Thread entry: park the native sp for the exit path, switch onto the
   root frame and run the bootstrap body (never returns). */
    .p2align 2
    .globl veneer_start_thread
    .type veneer_start_thread, %function
veneer_start_thread:
    push {{r4-r12,lr}}
    mrc p15, 0, ip, c13, c0, 2      /* thread control block */
    str sp, [ip, #4]                /* parked exit sp */
    ldr r6, [ip]                    /* root frame */
    mov sp, r6
    bl veneer_thread_init_body
    .size veneer_start_thread, . - veneer_start_thread

/* Thread exit: restore the parked sp (if any) and tail into the exit
   function with the code in r0. */
    .p2align 2
    .globl veneer_exit_thread
    .type veneer_exit_thread, %function
veneer_exit_thread:
    mrc p15, 0, r2, c13, c0, 2
    ldr r3, [r2, #4]
    mov ip, #0
    str ip, [r2, #4]
    cmp r3, ip
    movne sp, r3
    blx r1
    .size veneer_exit_thread, . - veneer_exit_thread
"#
);
