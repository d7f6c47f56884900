//! Host signal handlers and their installation.
//!
//! Each handler runs on the alternate stack with the full block mask and
//! treats the interrupted state as arbitrary: no allocation, no locks,
//! nothing that assumes a live register. The handler bodies are thin —
//! classification, the service-path redirect check, and the hand-off to
//! the exception bridge all live in the portable modules.

use std::io;
use std::mem;
use std::ptr;

#[cfg(all(target_arch = "arm", target_os = "linux"))]
use crate::classify::{self, FaultSignal};
#[cfg(all(target_arch = "arm", target_os = "linux"))]
use crate::context::{ContextFlags, CpuContext};
#[cfg(all(target_arch = "arm", target_os = "linux"))]
use crate::exception::ExceptionRecord;
#[cfg(all(target_arch = "arm", target_os = "linux"))]
use crate::host::HostContext;

/// Signals this layer owns.
const HANDLED_SIGNALS: [libc::c_int; 9] = [
    libc::SIGINT,
    libc::SIGFPE,
    libc::SIGABRT,
    libc::SIGQUIT,
    libc::SIGUSR1,
    libc::SIGTRAP,
    libc::SIGSEGV,
    libc::SIGILL,
    libc::SIGBUS,
];

/// The block mask every handler runs under: all handled signals held off
/// until the handler returns.
fn block_set() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        for signal in HANDLED_SIGNALS {
            libc::sigaddset(&mut set, signal);
        }
        set
    }
}

/// Drop the block mask on the current thread; the bootstrap path runs
/// with it held until the first guest instruction.
#[cfg(all(target_arch = "arm", target_os = "linux"))]
pub(crate) fn unblock_handled_signals() {
    unsafe {
        let set = block_set();
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, ptr::null_mut());
    }
}

#[cfg(all(target_arch = "arm", target_os = "linux"))]
mod arm {
    use super::*;
    use crate::thread;

    /// Redirect a fault that hit while executing on the service stack.
    ///
    /// Faults inside a service body never reach the guest dispatcher:
    /// with a recovery point armed the signal context is pointed at the
    /// continuation-resume path; otherwise the service call is failed by
    /// entering the dispatcher's restore epilogue with the exception code
    /// as its status.
    unsafe fn handle_service_fault(uc: &mut HostContext, rec: &ExceptionRecord) -> bool {
        let Some(control) = thread::try_control() else {
            return false;
        };
        let recovery = control.recovery();
        if !control.inside_service_call(uc.mcontext.sp as usize) && recovery.is_null() {
            return false;
        }

        if !recovery.is_null() {
            // Resume the armed recovery point with value 1.
            // SAFETY: the point is published only while its native frame
            // is live; disarm keeps the single-use contract.
            unsafe { (*recovery).disarm() };
            control.set_recovery(ptr::null_mut());
            uc.mcontext.r[0] = unsafe { (*recovery).save_ptr() as u32 };
            uc.mcontext.r[1] = 1;
            uc.mcontext.pc = crate::adapter::cont_resume as usize as u32;
        } else {
            uc.mcontext.r[0] = control.current_frame() as u32;
            uc.mcontext.r[1] = rec.code.0;
            uc.mcontext.pc = crate::adapter::veneer_dispatcher_return as usize as u32;
        }
        true
    }

    pub(super) unsafe extern "C" fn segv_handler(
        signal: libc::c_int,
        info: *mut libc::siginfo_t,
        sigcontext: *mut libc::c_void,
    ) {
        // SAFETY: the kernel hands an ARM ucontext_t to SA_SIGINFO
        // handlers; HostContext mirrors it.
        let uc = unsafe { &mut *(sigcontext as *mut HostContext) };
        let fault_signal = match signal {
            libc::SIGILL => FaultSignal::Ill,
            libc::SIGBUS => FaultSignal::Bus,
            _ => FaultSignal::Segv,
        };
        let fault_addr = unsafe { (*info).si_addr() as u32 };
        // The faulting halfword, for the breakpoint-encoding check. Only
        // read on illegal-instruction traps, where the PC itself is
        // known-mapped (the instruction was fetched to fault).
        let insn = match classify::trap_code(fault_signal, uc) {
            classify::TrapCode::IllegalInstruction => unsafe {
                ptr::read((uc.mcontext.pc & !1) as usize as *const u16)
            },
            _ => 0,
        };

        let hooks = crate::hooks::hooks();
        let Some(rec) = classify::classify_fault(fault_signal, uc, fault_addr, insn, hooks)
        else {
            return; // resolved transparently
        };
        if unsafe { handle_service_fault(uc, &rec) } {
            return;
        }
        unsafe { crate::unwind::raise_guest_exception(uc, rec, hooks, crate::hooks::entries()) };
    }

    pub(super) unsafe extern "C" fn trap_handler(
        _signal: libc::c_int,
        info: *mut libc::siginfo_t,
        sigcontext: *mut libc::c_void,
    ) {
        let uc = unsafe { &mut *(sigcontext as *mut HostContext) };
        let rec = classify::classify_trace(unsafe { (*info).si_code });
        unsafe {
            crate::unwind::raise_guest_exception(
                uc,
                rec,
                crate::hooks::hooks(),
                crate::hooks::entries(),
            )
        };
    }

    pub(super) unsafe extern "C" fn fpe_handler(
        _signal: libc::c_int,
        info: *mut libc::siginfo_t,
        sigcontext: *mut libc::c_void,
    ) {
        let uc = unsafe { &mut *(sigcontext as *mut HostContext) };
        let rec = classify::classify_fpe(unsafe { (*info).si_code });
        unsafe {
            crate::unwind::raise_guest_exception(
                uc,
                rec,
                crate::hooks::hooks(),
                crate::hooks::entries(),
            )
        };
    }

    pub(super) unsafe extern "C" fn int_handler(
        _signal: libc::c_int,
        _info: *mut libc::siginfo_t,
        _sigcontext: *mut libc::c_void,
    ) {
        crate::hooks::hooks().on_interrupt();
    }

    pub(super) unsafe extern "C" fn abrt_handler(
        _signal: libc::c_int,
        _info: *mut libc::siginfo_t,
        sigcontext: *mut libc::c_void,
    ) {
        let uc = unsafe { &mut *(sigcontext as *mut HostContext) };
        let rec = ExceptionRecord::noncontinuable(crate::status::Status::ASSERTION_FAILURE);
        unsafe {
            crate::unwind::raise_guest_exception(
                uc,
                rec,
                crate::hooks::hooks(),
                crate::hooks::entries(),
            )
        };
    }

    pub(super) unsafe extern "C" fn quit_handler(
        _signal: libc::c_int,
        _info: *mut libc::siginfo_t,
        _sigcontext: *mut libc::c_void,
    ) {
        crate::hooks::hooks().abort_thread(0)
    }

    /// Suspend request. The thread parks in the suspend-wait hook with
    /// its full context exposed; the suspender may rewrite it before the
    /// thread resumes.
    pub(super) unsafe extern "C" fn usr1_handler(
        _signal: libc::c_int,
        _info: *mut libc::siginfo_t,
        sigcontext: *mut libc::c_void,
    ) {
        let uc = unsafe { &mut *(sigcontext as *mut HostContext) };
        let hooks = crate::hooks::hooks();
        let inside = thread::try_control()
            .is_some_and(|control| control.inside_service_call(uc.mcontext.sp as usize));

        let mut context = CpuContext::zeroed();
        if inside {
            // Mid-service: the frame holds the guest state.
            context.flags = ContextFlags::FULL;
            crate::dispatch::read_thread_context(&mut context);
            hooks.wait_suspend(&mut context);
            crate::dispatch::set_full_thread_context(&context);
        } else {
            crate::host::capture_into(&mut context, uc);
            hooks.wait_suspend(&mut context);
            crate::host::apply(&context, uc);
        }
    }
}

/// Install one handler with the layer's standard flags.
fn register(
    signal: libc::c_int,
    handler: unsafe extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void),
) -> Result<(), anyhow::Error> {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_mask = block_set();
        action.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO | libc::SA_ONSTACK;
        action.sa_sigaction = handler as usize;
        if libc::sigaction(signal, &action, ptr::null_mut()) != 0 {
            anyhow::bail!(
                "sigaction({signal}) failed: {}",
                io::Error::last_os_error()
            );
        }
    }
    Ok(())
}

/// Install the full handler set. One registration per fault class; the
/// memory/illegal handler covers SIGSEGV, SIGILL and SIGBUS.
#[cfg(all(target_arch = "arm", target_os = "linux"))]
pub(crate) fn install() -> Result<(), anyhow::Error> {
    register(libc::SIGINT, arm::int_handler)?;
    register(libc::SIGFPE, arm::fpe_handler)?;
    register(libc::SIGABRT, arm::abrt_handler)?;
    register(libc::SIGQUIT, arm::quit_handler)?;
    register(libc::SIGUSR1, arm::usr1_handler)?;
    register(libc::SIGTRAP, arm::trap_handler)?;
    register(libc::SIGSEGV, arm::segv_handler)?;
    register(libc::SIGILL, arm::segv_handler)?;
    register(libc::SIGBUS, arm::segv_handler)?;
    Ok(())
}

/// Off-target builds carry the portable layers only; there is no signal
/// context to translate, so nothing is installed.
#[cfg(not(all(target_arch = "arm", target_os = "linux")))]
pub(crate) fn install() -> Result<(), anyhow::Error> {
    Ok(())
}
