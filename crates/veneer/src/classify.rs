//! Host trap → guest exception record classification.
//!
//! Deterministic tables: the architecture-reported trap subcode (when the
//! kernel supplies one) selects the exception code; otherwise the signal
//! kind alone does. Two special cases sit in front of the tables: the
//! reserved breakpoint encoding inside an illegal-instruction trap, and
//! memory faults the resolution service absorbs without an exception.

use crate::exception::ExceptionRecord;
use crate::hooks::HostHooks;
use crate::host::{ERROR_CODE_WRITE, HostContext};
use crate::status::Status;

/// FPE sub-codes (`siginfo.si_code`) as defined by the Linux kernel ABI.
///
/// The `libc` crate does not expose these constants for `*-linux` targets
/// (only for `aix`/`hurd`), so they are mirrored here with their fixed
/// asm-generic values.
mod fpe {
    pub const FPE_INTDIV: i32 = 1;
    pub const FPE_INTOVF: i32 = 2;
    pub const FPE_FLTDIV: i32 = 3;
    pub const FPE_FLTOVF: i32 = 4;
    pub const FPE_FLTUND: i32 = 5;
    pub const FPE_FLTRES: i32 = 6;
    pub const FPE_FLTSUB: i32 = 8;
}

/// Faulting-instruction halfword the guest ABI reserves as a breakpoint.
pub(crate) const BREAKPOINT_ENCODING: u16 = 0xdefe;

/// Trap subcodes the kernel reports in the signal context.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum TrapCode {
    /// Undefined/privileged instruction.
    IllegalInstruction,
    /// Translation or permission fault.
    PageFault,
    /// Unaligned access.
    Alignment,
    /// A subcode this layer has no mapping for.
    Other(u32),
}

const TRAP_ILLEGAL: u32 = 6;
const TRAP_PAGE_FAULT: u32 = 14;
const TRAP_ALIGNMENT: u32 = 17;

/// Fault-class signals sharing one handler.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum FaultSignal {
    Segv,
    Ill,
    Bus,
}

/// Trap subcode for a fault, falling back to a per-signal default when
/// the kernel did not fill one in.
pub(crate) fn trap_code(signal: FaultSignal, uc: &HostContext) -> TrapCode {
    match uc.mcontext.trap_no {
        0 => match signal {
            FaultSignal::Ill => TrapCode::IllegalInstruction,
            FaultSignal::Segv => TrapCode::PageFault,
            FaultSignal::Bus => TrapCode::Alignment,
        },
        TRAP_ILLEGAL => TrapCode::IllegalInstruction,
        TRAP_PAGE_FAULT => TrapCode::PageFault,
        TRAP_ALIGNMENT => TrapCode::Alignment,
        other => TrapCode::Other(other),
    }
}

/// Classify a memory/illegal-instruction fault.
///
/// `insn` is the halfword at the faulting PC, pre-fetched by the handler
/// (only meaningful for illegal-instruction traps). Returns `None` when
/// the fault-resolution service absorbed the fault: control goes straight
/// back to the faulting instruction.
pub(crate) fn classify_fault(
    signal: FaultSignal,
    uc: &HostContext,
    fault_addr: u32,
    insn: u16,
    hooks: &dyn HostHooks,
) -> Option<ExceptionRecord> {
    let mut rec = match trap_code(signal, uc) {
        TrapCode::IllegalInstruction => {
            if insn == BREAKPOINT_ENCODING {
                let mut rec = ExceptionRecord::new(Status::BREAKPOINT);
                rec.param_count = 1;
                rec
            } else {
                ExceptionRecord::new(Status::ILLEGAL_INSTRUCTION)
            }
        }
        TrapCode::PageFault => {
            let is_write = uc.mcontext.error_code & ERROR_CODE_WRITE != 0;
            let mut rec = ExceptionRecord::new(Status::SUCCESS);
            rec.param_count = 2;
            rec.params[0] = is_write as u32;
            rec.params[1] = fault_addr;
            rec.code = hooks.resolve_fault(fault_addr, is_write, uc.mcontext.sp);
            if rec.code.is_success() {
                return None;
            }
            rec
        }
        TrapCode::Alignment => ExceptionRecord::new(Status::DATATYPE_MISALIGNMENT),
        TrapCode::Other(code) => {
            log::error!("unmapped trap subcode {code}");
            let mut rec = ExceptionRecord::new(Status::ACCESS_VIOLATION);
            rec.param_count = 2;
            rec.params = [0, 0xffff_ffff];
            rec
        }
    };
    rec.address = uc.mcontext.pc;
    Some(rec)
}

/// Classify a trace/breakpoint trap by `si_code`.
pub(crate) fn classify_trace(si_code: i32) -> ExceptionRecord {
    if si_code == libc::TRAP_TRACE {
        ExceptionRecord::new(Status::SINGLE_STEP)
    } else {
        let mut rec = ExceptionRecord::new(Status::BREAKPOINT);
        rec.param_count = 1;
        rec
    }
}

/// Classify a floating-point/arithmetic trap by `si_code`.
pub(crate) fn classify_fpe(si_code: i32) -> ExceptionRecord {
    let code = match si_code & 0xffff {
        fpe::FPE_FLTSUB => Status::ARRAY_BOUNDS_EXCEEDED,
        fpe::FPE_INTDIV => Status::INT_DIVIDE_BY_ZERO,
        fpe::FPE_INTOVF => Status::INT_OVERFLOW,
        fpe::FPE_FLTDIV => Status::FLT_DIVIDE_BY_ZERO,
        fpe::FPE_FLTOVF => Status::FLT_OVERFLOW,
        fpe::FPE_FLTUND => Status::FLT_UNDERFLOW,
        fpe::FPE_FLTRES => Status::FLT_INEXACT_RESULT,
        _ => Status::FLT_INVALID_OPERATION,
    };
    ExceptionRecord::new(code)
}
