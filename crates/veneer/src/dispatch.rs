//! Service-path operations on the current thread's frame: context
//! access, guest dispatcher redirects, APC delivery, and the thread
//! bootstrap/exit paths.
//!
//! Everything here runs inside a service call, so "the frame" is the
//! current [`SyscallFrame`] — the register image the dispatcher will
//! restore when the call returns. Redirecting guest execution means
//! editing that image and flagging the touched groups for restore.

use crate::context::{CPSR_ALT_ENCODING, ContextFlags, CpuContext};
use crate::exception::ExceptionRecord;
use crate::frame::{SyscallFrame, read_frame_context, write_frame_context};
use crate::status::Status;
use crate::thread;

/// Address of the guest-facing service-call entry, for generating the
/// guest-side service stubs.
pub fn service_entry_point() -> usize {
    crate::adapter::service_dispatcher_addr()
}

/// Copy the requested register groups of the current thread's frame into
/// `ctx`. `ctx.flags` selects the groups.
pub fn read_thread_context(ctx: &mut CpuContext) -> Status {
    read_frame_context(thread::control().frame(), ctx);
    Status::SUCCESS
}

/// Copy the valid register groups of `ctx` into the current thread's
/// frame. The written control/FP groups are flagged for restore; the
/// integer group is not (r0 carries the service status on the normal
/// return path).
pub fn write_thread_context(ctx: &CpuContext) -> Status {
    write_frame_context(thread::control().frame(), ctx);
    Status::SUCCESS
}

/// [`write_thread_context`], but also forcing the integer group to be
/// restored — used when the caller intends `ctx` to fully replace the
/// guest state, r0 included.
pub fn set_full_thread_context(ctx: &CpuContext) -> Status {
    let status = write_thread_context(ctx);
    if status.is_success() && ctx.flags.contains(ContextFlags::INTEGER) {
        thread::control().frame().restore_flags |= ContextFlags::INTEGER;
    }
    status
}

/// Guest-stack record for one APC delivery.
#[repr(C)]
struct ApcBlock {
    func: u32,
    align: u32,
    context: CpuContext,
}

/// Point a frame at the guest APC dispatcher.
///
/// Pure image edit, shared by [`call_guest_apc`] and its tests: the
/// dispatcher receives the on-stack context in r0 and the routine's
/// arguments in r1..r3.
fn build_apc_frame(
    frame: &mut SyscallFrame,
    block_addr: u32,
    context_addr: u32,
    arg1: u32,
    arg2: u32,
    arg3: u32,
    dispatcher: u32,
) {
    frame.sp = block_addr;
    frame.pc = dispatcher;
    frame.r[0] = context_addr;
    frame.r[1] = arg1;
    frame.r[2] = arg2;
    frame.r[3] = arg3;
    frame.restore_flags |= ContextFlags::CONTROL | ContextFlags::INTEGER;
}

/// Deliver an asynchronous procedure call to guest code.
///
/// Builds a `{routine, context}` record below the target guest SP and
/// redirects the current frame to the guest APC dispatcher. With an
/// explicit `context` the record captures it and the frame is replaced
/// from it; otherwise the current full context is captured and its r0
/// replaced with `status` so the interrupted service call's result
/// survives the detour.
///
/// # Safety
///
/// Must run inside a service call on an initialized thread, with enough
/// addressable guest stack below the target SP for the record.
pub unsafe fn call_guest_apc(
    context: Option<&CpuContext>,
    arg1: u32,
    arg2: u32,
    arg3: u32,
    func: u32,
    status: Status,
) -> Status {
    let control = thread::control();
    let sp = match context {
        Some(ctx) => ctx.sp,
        None => control.frame().sp,
    };
    let block_addr = (sp & !15) - size_of::<ApcBlock>() as u32;
    let block = block_addr as usize as *mut ApcBlock;

    // SAFETY: per contract the guest stack below `sp` is addressable.
    unsafe {
        match context {
            Some(ctx) => {
                (&raw mut (*block).context).write(*ctx);
                set_full_thread_context(&(*block).context);
            }
            None => {
                let mut current = CpuContext::zeroed();
                current.flags = ContextFlags::FULL;
                read_thread_context(&mut current);
                current.r[0] = status.0;
                (&raw mut (*block).context).write(current);
            }
        }
        (&raw mut (*block).func).write(func);
    }

    let context_addr = block_addr + core::mem::offset_of!(ApcBlock, context) as u32;
    build_apc_frame(
        control.frame(),
        block_addr,
        context_addr,
        arg1,
        arg2,
        arg3,
        crate::hooks::entries().apc_dispatcher,
    );
    status
}

/// Redirect the current frame into the guest exception dispatcher with
/// `rec`/`ctx` as its arguments, after installing `ctx` as the frame
/// image. The frame's own sp/lr survive: the dispatcher runs on the
/// interrupted guest stack.
///
/// # Safety
///
/// `rec` and `ctx` must point into guest-addressable memory that outlives
/// the dispatch.
pub unsafe fn call_guest_exception_dispatcher(
    rec: *const ExceptionRecord,
    ctx: *const CpuContext,
) -> Status {
    let control = thread::control();
    let frame = control.frame();
    let lr = frame.lr;
    let sp = frame.sp;
    // SAFETY: caller guarantees ctx is readable.
    let status = set_full_thread_context(unsafe { &*ctx });
    if !status.is_success() {
        return status;
    }
    let frame = control.frame();
    frame.r[0] = rec as usize as u32;
    frame.r[1] = ctx as usize as u32;
    frame.pc = crate::hooks::entries().exception_dispatcher;
    frame.lr = lr;
    frame.sp = sp;
    frame.restore_flags |= ContextFlags::INTEGER | ContextFlags::CONTROL;
    status
}

/// Redirect the current frame's resume point into the guest's deferred
/// user-exception raise entry.
pub fn call_guest_raise_exception() {
    let control = thread::control();
    control.frame().pc = crate::hooks::entries().raise_exception_dispatcher;
}

/// Initial guest context for a new thread.
fn initial_thread_context(entry: u32, arg: u32, guest_stack: u32, thread_start: u32) -> CpuContext {
    let mut ctx = CpuContext::zeroed();
    ctx.flags = ContextFlags::FULL;
    ctx.r[0] = entry;
    ctx.r[1] = arg;
    ctx.sp = guest_stack;
    ctx.pc = thread_start;
    if ctx.pc & 1 != 0 {
        ctx.cpsr |= CPSR_ALT_ENCODING;
    }
    ctx
}

/// Thread bootstrap body, entered from the start trampoline already on
/// the service stack. Builds the initial context, honors a creation-time
/// suspend, parks the context on the guest stack and enters guest code
/// through the dispatcher's restore path.
#[cfg(all(target_arch = "arm", target_os = "linux"))]
#[unsafe(no_mangle)]
unsafe extern "C" fn veneer_thread_init_body(
    entry: u32,
    arg: u32,
    suspend: u32,
    guest_stack: u32,
) -> ! {
    let control = thread::control();
    let entries = crate::hooks::entries();
    let mut context = initial_thread_context(entry, arg, guest_stack, entries.thread_start);

    if suspend != 0 {
        crate::hooks::hooks().wait_suspend(&mut context);
    }

    let ctx_addr = (context.sp & !15) - size_of::<CpuContext>() as u32;
    // SAFETY: the embedder handed us a mapped guest stack; the context
    // block is its first occupant.
    let ctx_ptr = ctx_addr as usize as *mut CpuContext;
    unsafe {
        ctx_ptr.write(context);
        (*ctx_ptr).flags = ContextFlags::FULL;
        set_full_thread_context(&*ctx_ptr);
    }

    let frame = control.frame();
    frame.sp = ctx_addr;
    frame.pc = entries.thread_init_dispatcher;
    frame.r[0] = ctx_addr;
    frame.prev_frame = core::ptr::null_mut();
    frame.restore_flags |= ContextFlags::INTEGER;

    crate::signals::unblock_handled_signals();
    // SAFETY: the frame image is complete; this never returns.
    unsafe { crate::adapter::veneer_dispatcher_return(frame, 0) }
}

/// Enter guest execution on this thread for the first time.
///
/// # Safety
///
/// The thread must be initialized, `guest_stack` mapped, and the process
/// hooks registered. Never returns; the thread leaves through
/// [`exit_current_thread`] or teardown.
#[cfg(all(target_arch = "arm", target_os = "linux"))]
pub unsafe fn start_thread(entry: u32, arg: u32, suspend: bool, guest_stack: u32) -> ! {
    unsafe { crate::adapter::veneer_start_thread(entry, arg, suspend as u32, guest_stack) }
}

#[cfg(all(target_arch = "arm", target_os = "linux"))]
unsafe extern "C" fn exit_thread_trampoline(code: u32) -> ! {
    crate::hooks::hooks().abort_thread(code)
}

/// Leave guest execution, restoring the native stack parked at thread
/// start, and hand the thread to the teardown hook.
///
/// # Safety
///
/// Must run on a thread that entered through [`start_thread`].
#[cfg(all(target_arch = "arm", target_os = "linux"))]
pub unsafe fn exit_current_thread(code: u32) -> ! {
    unsafe { crate::adapter::veneer_exit_thread(code, exit_thread_trampoline) }
}

/// Run `f` with a fault-recovery point armed: a memory fault inside `f`
/// lands back here with `ACCESS_VIOLATION` instead of raising a guest
/// exception. For fragile guest-memory accesses on the service path.
///
/// # Safety
///
/// `f` must be safe to abandon at any point — the recovery transfer skips
/// its destructors.
#[cfg(all(target_arch = "arm", target_os = "linux"))]
pub unsafe fn with_fault_recovery<T>(f: impl FnOnce() -> T) -> Result<T, Status> {
    use crate::continuation::ContinuationPoint;

    let control = thread::control();
    let point = ContinuationPoint::new();
    // SAFETY: the point lives across f(); the handler resumes it only
    // while it is published.
    let result = unsafe {
        if point.mark() == 0 {
            control.set_recovery(&point as *const ContinuationPoint as *mut ContinuationPoint);
            let value = f();
            Ok(value)
        } else {
            Err(Status::ACCESS_VIOLATION)
        }
    };
    control.set_recovery(core::ptr::null_mut());
    result
}

#[cfg(not(all(target_arch = "arm", target_os = "linux")))]
pub unsafe fn start_thread(_entry: u32, _arg: u32, _suspend: bool, _guest_stack: u32) -> ! {
    unimplemented!("thread entry requires the ARM adapter")
}

#[cfg(not(all(target_arch = "arm", target_os = "linux")))]
pub unsafe fn exit_current_thread(_code: u32) -> ! {
    unimplemented!("thread exit requires the ARM adapter")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn on_fresh_thread(f: impl FnOnce() + Send + 'static) {
        std::thread::spawn(move || {
            thread::init_thread(std::ptr::null()).unwrap();
            f();
            thread::teardown_thread();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn thread_context_respects_request_mask() {
        on_fresh_thread(|| {
            let frame = thread::control().frame();
            frame.r = [0x11; 13];
            frame.sp = 0x9000;
            frame.pc = 0x8000;
            frame.d = [3; 32];

            let mut ctx = CpuContext::zeroed();
            ctx.flags = ContextFlags::INTEGER;
            read_thread_context(&mut ctx);
            assert_eq!(ctx.r, [0x11; 13]);
            // Control group was not requested.
            assert_eq!(ctx.sp, 0);
            assert_eq!(ctx.pc, 0);
        });
    }

    #[test]
    fn full_write_forces_integer_restore() {
        on_fresh_thread(|| {
            let mut ctx = CpuContext::zeroed();
            ctx.flags = ContextFlags::FULL;
            ctx.r[0] = 0x42;

            write_thread_context(&ctx);
            let flags = thread::control().frame().restore_flags;
            assert!(!flags.contains(ContextFlags::INTEGER));

            set_full_thread_context(&ctx);
            let flags = thread::control().frame().restore_flags;
            assert!(flags.contains(ContextFlags::INTEGER));
            assert_eq!(thread::control().frame().r[0], 0x42);
        });
    }

    #[test]
    fn apc_frame_image() {
        let mut frame = SyscallFrame::zeroed();
        build_apc_frame(&mut frame, 0x7000_0000, 0x7000_0008, 1, 2, 3, 0x4200_0000);
        assert_eq!(frame.sp, 0x7000_0000);
        assert_eq!(frame.pc, 0x4200_0000);
        assert_eq!(frame.r[0], 0x7000_0008);
        assert_eq!(frame.r[1..4], [1, 2, 3]);
        assert!(
            frame
                .restore_flags
                .contains(ContextFlags::CONTROL | ContextFlags::INTEGER)
        );
    }

    #[test]
    fn initial_context_enters_thread_start() {
        let ctx = initial_thread_context(0x1111, 0x2222, 0x7f00_0000, 0x4001);
        assert_eq!(ctx.r[0], 0x1111);
        assert_eq!(ctx.r[1], 0x2222);
        assert_eq!(ctx.sp, 0x7f00_0000);
        assert_eq!(ctx.pc, 0x4001);
        assert_eq!(
            ctx.cpsr & CPSR_ALT_ENCODING,
            CPSR_ALT_ENCODING,
            "odd entry selects the alternate encoding"
        );
        assert_eq!(ctx.flags, ContextFlags::FULL);
    }

    #[test]
    fn raise_redirect_needs_entries() {
        // call_guest_raise_exception reaches for the registered entry
        // points; without process init it must fail loudly, not wander.
        on_fresh_thread(|| {
            let caught = std::panic::catch_unwind(call_guest_raise_exception);
            assert!(caught.is_err());
        });
    }
}
