//! The exception/unwind bridge: hands a faulted context to the guest
//! structured-exception dispatcher, and steps the native call stack one
//! frame at a time when the in-frame fast path is not enough.
//!
//! Frame stepping is consumed as an opaque service through
//! [`FrameStepper`]; this module owns only the decision logic around it
//! (leaf-function fallback, the trampoline's two-register restore).

use crate::adapter;
use crate::context::{CPSR_ALT_ENCODING, ContextFlags, CpuContext};
use crate::exception::ExceptionRecord;
use crate::hooks::{DebugDisposition, GuestEntryPoints, HostHooks};
use crate::host::{HostContext, apply, capture};
use crate::status::Status;

/// Address of the raise trampoline.
///
/// Exposed so stepping-service implementations and debug transports can
/// recognize frames established by exception delivery.
pub fn raise_trampoline_entry() -> usize {
    adapter::raise_trampoline_addr()
}

/// What travels to the guest dispatcher: the full faulted context and
/// the record, parked on the faulting thread's own stack.
#[repr(C)]
struct TransferBlock {
    context: CpuContext,
    record: ExceptionRecord,
}

/// Address of the transfer block below a faulting stack pointer, aligned
/// for its FP register file.
fn transfer_block_addr(sp: u32) -> u32 {
    ((sp & !3) - size_of::<TransferBlock>() as u32) & !7
}

/// Rewrite a faulted signal context to deliver an exception to guest
/// code.
///
/// First-chance debugger notification happens before anything else; a
/// `Continue`/`Handled` verdict restores the faulted context unchanged
/// and suppresses the exception. Otherwise the transfer block is built
/// below the faulting SP and the context is pointed at the raise
/// trampoline with the dispatcher's two arguments staged in `r0`/`r1`.
///
/// # Safety
///
/// Must run on the faulting thread with the guest stack below
/// `uc.mcontext.sp` addressable for the transfer block.
pub unsafe fn raise_guest_exception(
    uc: &mut HostContext,
    mut rec: ExceptionRecord,
    hooks: &dyn HostHooks,
    entries: &GuestEntryPoints,
) {
    rec.address = uc.mcontext.pc;
    let context = capture(uc);

    match hooks.notify_debugger(&rec, &context, true) {
        DebugDisposition::Continue | DebugDisposition::Handled => {
            apply(&context, uc);
            return;
        }
        DebugDisposition::NotHandled => {}
    }

    let block_addr = transfer_block_addr(uc.mcontext.sp);
    let block = block_addr as usize as *mut TransferBlock;
    // SAFETY: per contract the guest stack below sp is addressable.
    unsafe {
        (&raw mut (*block).context).write(context);
        (&raw mut (*block).record).write(rec);
    }

    let mc = &mut uc.mcontext;
    mc.sp = block_addr;
    mc.lr = context.pc;
    mc.pc = adapter::raise_trampoline_addr() as u32;
    if mc.pc & 1 != 0 {
        mc.cpsr |= CPSR_ALT_ENCODING;
    } else {
        mc.cpsr &= !CPSR_ALT_ENCODING;
    }
    mc.r[0] = block_addr + core::mem::offset_of!(TransferBlock, record) as u32;
    mc.r[1] = block_addr + core::mem::offset_of!(TransferBlock, context) as u32;
    mc.r[2] = entries.exception_dispatcher;
}

/// Unwind metadata for one native frame.
#[derive(Clone, Copy, Debug)]
pub struct FrameInfo {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    pub handler_data: u32,
}

/// Stepping-service failure; the wrapped code is the service's own.
#[derive(Clone, Copy, Debug)]
pub struct StepError(pub i32);

/// Registers recoverable from a stepping cursor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnwindReg {
    /// r0..r12.
    R(u8),
    Sp,
    Lr,
    Pc,
}

/// One-frame stepping service over the native stack. External and
/// opaque: implementations wrap whatever unwinder the platform offers.
pub trait FrameStepper {
    /// Position a cursor at the frame described by `ctx`.
    fn init(&mut self, ctx: &CpuContext) -> Result<(), StepError>;

    /// Unwind metadata covering `pc`, or `None` when the service has no
    /// record of it.
    fn find_frame(&mut self, pc: u32) -> Result<Option<FrameInfo>, StepError>;

    /// Advance the cursor one frame toward the caller.
    fn step(&mut self) -> Result<(), StepError>;

    /// Read a register as recovered at the cursor's current frame.
    fn get_register(&mut self, reg: UnwindReg) -> u32;
}

/// Per-unwind bookkeeping shared with the guest's dispatch machinery.
#[derive(Clone, Copy, Debug, Default)]
pub struct DispatchInfo {
    /// The control PC was produced by a prior unwind step (it points
    /// after the call, not at it).
    pub control_pc_is_unwound: bool,
    /// Language handler for the stepped frame; 0 when none.
    pub handler: u32,
    pub handler_data: u32,
    /// SP at the point the stepped frame was established.
    pub establisher_frame: u32,
}

/// Step `ctx` one native frame toward the caller.
///
/// Three outcomes: metadata found (step, report handler and establisher
/// frame), metadata absent with `pc != lr` (leaf function: the return
/// address register still holds the way back), metadata absent with
/// `pc == lr` (stuck — fatal for the caller). On success the context is
/// flagged [`ContextFlags::UNWOUND_TO_CALL`].
///
/// Frames established by the raise trampoline need their LR restored
/// from the slot stored below the transfer block: the stepping service
/// cannot restore PC and LR to two different values in one step, and the
/// frame being unwound to may be a leaf that never saved its own LR.
///
/// # Safety
///
/// `ctx` must describe live native frames on the current thread's stack;
/// the trampoline fixup reads through the established frame pointer.
pub unsafe fn unwind_one_frame(
    ctx: &mut CpuContext,
    dispatch: &mut DispatchInfo,
    stepper: &mut dyn FrameStepper,
) -> Status {
    let ip = ctx.pc - if dispatch.control_pc_is_unwound { 2 } else { 0 };

    if let Err(err) = stepper.init(ctx) {
        log::warn!("unwind setup failed: {}", err.0);
        return Status::INVALID_DISPOSITION;
    }

    let info = match stepper.find_frame(ip) {
        Err(err) => {
            log::warn!("no unwind info for {ip:#x}: {}", err.0);
            return Status::INVALID_DISPOSITION;
        }
        Ok(info) => info,
    };

    let info = match info {
        Some(info) if ip >= info.start && ip <= info.end => info,
        _ => {
            // No metadata: a leaf function still holds its return
            // address in lr; equal pc/lr means stepping cannot make
            // progress.
            let status = if ctx.pc != ctx.lr {
                Status::SUCCESS
            } else {
                Status::INVALID_DISPOSITION
            };
            log::trace!(
                "no frame info for pc {:#x}, {}",
                ctx.pc,
                if status.is_success() { "assuming leaf function" } else { "stuck" }
            );
            dispatch.handler = 0;
            dispatch.establisher_frame = ctx.sp;
            ctx.pc = ctx.lr;
            ctx.flags |= ContextFlags::UNWOUND_TO_CALL;
            return status;
        }
    };

    log::trace!(
        "ip {ip:#x} function {:#x}-{:#x} handler {:#x} data {:#x}",
        info.start,
        info.end,
        info.handler,
        info.handler_data
    );

    if let Err(err) = stepper.step() {
        log::warn!("failed to unwind: {}", err.0);
        return Status::INVALID_DISPOSITION;
    }

    dispatch.handler = info.handler;
    dispatch.handler_data = info.handler_data;
    dispatch.establisher_frame = ctx.sp;

    for i in 0..13 {
        ctx.r[i as usize] = stepper.get_register(UnwindReg::R(i));
    }
    ctx.sp = stepper.get_register(UnwindReg::Sp);
    ctx.lr = stepper.get_register(UnwindReg::Lr);
    ctx.pc = stepper.get_register(UnwindReg::Pc);
    ctx.flags |= ContextFlags::UNWOUND_TO_CALL;

    if info.start & !1 == adapter::raise_trampoline_addr() as u32 & !1 {
        // SAFETY: frames established by the trampoline always have the
        // stored original LR at the established frame base.
        ctx.lr = unsafe {
            core::ptr::read(dispatch.establisher_frame as usize as *const u32)
        };
    }

    log::trace!("next frame pc={:#x} sp={:#x} lr={:#x}", ctx.pc, ctx.sp, ctx.lr);
    Status::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted stepper: fixed metadata lookup plus a canned register
    /// image for the stepped frame.
    struct ScriptedStepper {
        info: Option<FrameInfo>,
        regs: [u32; 16],
        init_error: Option<StepError>,
        step_error: Option<StepError>,
        stepped: bool,
    }

    impl ScriptedStepper {
        fn with_info(info: Option<FrameInfo>) -> Self {
            ScriptedStepper {
                info,
                regs: core::array::from_fn(|i| 0x100 + i as u32),
                init_error: None,
                step_error: None,
                stepped: false,
            }
        }
    }

    impl FrameStepper for ScriptedStepper {
        fn init(&mut self, _ctx: &CpuContext) -> Result<(), StepError> {
            match self.init_error {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        fn find_frame(&mut self, _pc: u32) -> Result<Option<FrameInfo>, StepError> {
            Ok(self.info)
        }

        fn step(&mut self) -> Result<(), StepError> {
            match self.step_error {
                Some(err) => Err(err),
                None => {
                    self.stepped = true;
                    Ok(())
                }
            }
        }

        fn get_register(&mut self, reg: UnwindReg) -> u32 {
            match reg {
                UnwindReg::R(i) => self.regs[i as usize],
                UnwindReg::Sp => self.regs[13],
                UnwindReg::Lr => self.regs[14],
                UnwindReg::Pc => self.regs[15],
            }
        }
    }

    fn faulted_context() -> CpuContext {
        let mut ctx = CpuContext::zeroed();
        ctx.flags = ContextFlags::FULL;
        ctx.pc = 0x5000;
        ctx.lr = 0x4800;
        ctx.sp = 0x7000_0000;
        ctx
    }

    #[test]
    fn stepped_frame_reports_handler_and_registers() {
        let mut ctx = faulted_context();
        let mut dispatch = DispatchInfo::default();
        let mut stepper = ScriptedStepper::with_info(Some(FrameInfo {
            start: 0x4f00,
            end: 0x5100,
            handler: 0x6000,
            handler_data: 0x6100,
        }));

        let status = unsafe { unwind_one_frame(&mut ctx, &mut dispatch, &mut stepper) };
        assert_eq!(status, Status::SUCCESS);
        assert!(stepper.stepped);
        assert_eq!(dispatch.handler, 0x6000);
        assert_eq!(dispatch.handler_data, 0x6100);
        // Establisher frame is the SP before register recovery.
        assert_eq!(dispatch.establisher_frame, 0x7000_0000);
        assert_eq!(ctx.r[0], 0x100);
        assert_eq!(ctx.sp, 0x100 + 13);
        assert_eq!(ctx.pc, 0x100 + 15);
        assert!(ctx.flags.contains(ContextFlags::UNWOUND_TO_CALL));
    }

    #[test]
    fn leaf_function_falls_back_to_link_register() {
        let mut ctx = faulted_context();
        let mut dispatch = DispatchInfo::default();
        let mut stepper = ScriptedStepper::with_info(None);

        let status = unsafe { unwind_one_frame(&mut ctx, &mut dispatch, &mut stepper) };
        assert_eq!(status, Status::SUCCESS);
        assert_eq!(ctx.pc, 0x4800, "pc := lr");
        assert_eq!(dispatch.handler, 0);
        assert_eq!(dispatch.establisher_frame, 0x7000_0000);
        assert!(ctx.flags.contains(ContextFlags::UNWOUND_TO_CALL));
    }

    #[test]
    fn out_of_range_metadata_is_treated_as_leaf() {
        let mut ctx = faulted_context();
        let mut dispatch = DispatchInfo::default();
        let mut stepper = ScriptedStepper::with_info(Some(FrameInfo {
            start: 0x9000,
            end: 0x9100,
            handler: 0x6000,
            handler_data: 0,
        }));

        let status = unsafe { unwind_one_frame(&mut ctx, &mut dispatch, &mut stepper) };
        assert_eq!(status, Status::SUCCESS);
        assert_eq!(ctx.pc, 0x4800);
        assert!(!stepper.stepped);
    }

    #[test]
    fn stuck_unwind_is_fatal() {
        let mut ctx = faulted_context();
        ctx.lr = ctx.pc;
        let mut dispatch = DispatchInfo::default();
        let mut stepper = ScriptedStepper::with_info(None);

        let status = unsafe { unwind_one_frame(&mut ctx, &mut dispatch, &mut stepper) };
        assert_eq!(status, Status::INVALID_DISPOSITION);
    }

    #[test]
    fn unwound_control_pc_is_backed_up_for_lookup() {
        let mut ctx = faulted_context();
        let mut dispatch = DispatchInfo::default();
        dispatch.control_pc_is_unwound = true;
        // Metadata covers [pc-2, pc-1] only: reachable solely through the
        // backed-up lookup address.
        let mut stepper = ScriptedStepper::with_info(Some(FrameInfo {
            start: ctx.pc - 2,
            end: ctx.pc - 1,
            handler: 0,
            handler_data: 0,
        }));

        let status = unsafe { unwind_one_frame(&mut ctx, &mut dispatch, &mut stepper) };
        assert_eq!(status, Status::SUCCESS);
        assert!(stepper.stepped);
    }

    #[test]
    fn setup_failure_reports_invalid_disposition() {
        let mut ctx = faulted_context();
        let mut dispatch = DispatchInfo::default();
        let mut stepper = ScriptedStepper::with_info(None);
        stepper.init_error = Some(StepError(-1));

        let status = unsafe { unwind_one_frame(&mut ctx, &mut dispatch, &mut stepper) };
        assert_eq!(status, Status::INVALID_DISPOSITION);
    }

    #[test]
    fn step_failure_reports_invalid_disposition() {
        let mut ctx = faulted_context();
        let mut dispatch = DispatchInfo::default();
        let mut stepper = ScriptedStepper::with_info(Some(FrameInfo {
            start: 0x4f00,
            end: 0x5100,
            handler: 0,
            handler_data: 0,
        }));
        stepper.step_error = Some(StepError(-5));

        let status = unsafe { unwind_one_frame(&mut ctx, &mut dispatch, &mut stepper) };
        assert_eq!(status, Status::INVALID_DISPOSITION);
    }
}
