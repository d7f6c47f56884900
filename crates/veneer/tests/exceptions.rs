use veneer::{
    ContextFlags, CpuContext, DebugDisposition, DispatchInfo, ExceptionRecord, FrameInfo,
    FrameStepper, GuestEntryPoints, HostContext, HostHooks, StepError, Status, UnwindReg,
    raise_guest_exception, raise_trampoline_entry, unwind_one_frame,
};

struct TestHooks {
    debugger: DebugDisposition,
}

impl HostHooks for TestHooks {
    fn notify_debugger(
        &self,
        _record: &ExceptionRecord,
        _context: &CpuContext,
        first_chance: bool,
    ) -> DebugDisposition {
        assert!(first_chance, "delivery always offers the first chance");
        self.debugger
    }

    fn resolve_fault(&self, _addr: u32, _is_write: bool, _stack_ptr: u32) -> Status {
        Status::ACCESS_VIOLATION
    }

    fn wait_suspend(&self, _context: &mut CpuContext) {}

    fn on_interrupt(&self) {}

    fn abort_thread(&self, _code: u32) -> ! {
        unreachable!()
    }
}

fn entries() -> GuestEntryPoints {
    GuestEntryPoints {
        exception_dispatcher: 0x0041_0000,
        callback_dispatcher: 0x0041_1000,
        apc_dispatcher: 0x0041_2000,
        raise_exception_dispatcher: 0x0041_3000,
        thread_init_dispatcher: 0x0041_4000,
        thread_start: 0x0041_5000,
    }
}

fn faulted_blob(pc: u32, sp: u32) -> HostContext {
    let mut uc = HostContext::zeroed();
    uc.mcontext.pc = pc;
    uc.mcontext.sp = sp;
    uc.mcontext.lr = 0x0040_0800;
    uc.mcontext.r = [0x11; 11];
    uc
}

#[test]
fn debugger_handled_fault_is_suppressed() -> Result<(), anyhow::Error> {
    let hooks = TestHooks {
        debugger: DebugDisposition::Handled,
    };
    let mut uc = faulted_blob(0x0040_2000, 0x7ffe_0000);
    let pristine = uc;

    let rec = ExceptionRecord::new(Status::ACCESS_VIOLATION);
    unsafe { raise_guest_exception(&mut uc, rec, &hooks, &entries()) };

    // The faulted context goes back unchanged: same resume point, same
    // stack, no transfer block.
    assert_eq!(uc.mcontext.pc, pristine.mcontext.pc);
    assert_eq!(uc.mcontext.sp, pristine.mcontext.sp);
    assert_eq!(uc.mcontext.r, pristine.mcontext.r);
    Ok(())
}

// The delivery and unwind fixup paths write through 32-bit guest
// addresses, so they are exercised where a 32-bit-addressable mapping
// exists: natively on the target, via MAP_32BIT on x86_64 hosts.
#[cfg(all(target_os = "linux", any(target_arch = "arm", target_arch = "x86_64")))]
mod guest_memory {
    use super::*;

    /// Map one page addressable through a u32.
    fn map_low_page() -> u32 {
        #[cfg(target_arch = "x86_64")]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_32BIT;
        #[cfg(not(target_arch = "x86_64"))]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON;

        let page = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                4096,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        assert_ne!(page, libc::MAP_FAILED);
        page as usize as u32
    }

    #[test]
    fn delivery_builds_the_transfer_block_below_sp() -> Result<(), anyhow::Error> {
        let hooks = TestHooks {
            debugger: DebugDisposition::NotHandled,
        };
        let sp = map_low_page() + 4096;
        let pc = 0x0040_2000;
        let mut uc = faulted_blob(pc, sp);

        let mut rec = ExceptionRecord::new(Status::ILLEGAL_INSTRUCTION);
        rec.param_count = 1;
        unsafe { raise_guest_exception(&mut uc, rec, &hooks, &entries()) };

        // Control lands in the trampoline with the block as the new SP.
        assert_eq!(uc.mcontext.pc, raise_trampoline_entry() as u32);
        assert_eq!(uc.mcontext.lr, pc, "faulting pc rides in lr");
        assert!(uc.mcontext.sp < sp);
        assert_eq!(uc.mcontext.sp % 8, 0);
        assert_eq!(uc.mcontext.r[2], entries().exception_dispatcher);

        // r0/r1 address the record and context copies inside the block.
        let delivered = unsafe { &*(uc.mcontext.r[0] as usize as *const ExceptionRecord) };
        assert_eq!(delivered.code, Status::ILLEGAL_INSTRUCTION);
        assert_eq!(delivered.param_count, 1);
        assert_eq!(delivered.address, pc, "record reports the faulting pc");

        let context = unsafe { &*(uc.mcontext.r[1] as usize as *const CpuContext) };
        assert_eq!(context.pc, pc);
        assert_eq!(context.sp, sp);
        assert_eq!(context.r[..11], [0x11; 11]);
        Ok(())
    }

    struct TrampolineStepper {
        regs: [u32; 16],
    }

    impl FrameStepper for TrampolineStepper {
        fn init(&mut self, _ctx: &CpuContext) -> Result<(), StepError> {
            Ok(())
        }

        fn find_frame(&mut self, _pc: u32) -> Result<Option<FrameInfo>, StepError> {
            let start = raise_trampoline_entry() as u32;
            Ok(Some(FrameInfo {
                start,
                end: start + 0x20,
                handler: 0,
                handler_data: 0,
            }))
        }

        fn step(&mut self) -> Result<(), StepError> {
            Ok(())
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

    #[test]
    fn stepping_off_the_trampoline_restores_lr_from_the_stored_slot() -> Result<(), anyhow::Error>
    {
        // The trampoline parks the original lr at its frame base; the
        // stepping service can only restore pc, so the fixup must read
        // the slot directly.
        let slot = map_low_page();
        let stored_lr = 0x0040_5678u32;
        unsafe { (slot as usize as *mut u32).write(stored_lr) };

        let mut ctx = CpuContext::zeroed();
        ctx.flags = ContextFlags::FULL;
        ctx.pc = raise_trampoline_entry() as u32 + 4;
        ctx.lr = 0x0040_0800;
        ctx.sp = slot;

        let mut stepper = TrampolineStepper {
            regs: core::array::from_fn(|i| 0x9000 + i as u32),
        };
        let mut dispatch = DispatchInfo::default();
        let status = unsafe { unwind_one_frame(&mut ctx, &mut dispatch, &mut stepper) };

        assert_eq!(status, Status::SUCCESS);
        assert_eq!(dispatch.establisher_frame, slot);
        assert_eq!(ctx.pc, 0x9000 + 15, "pc comes from the stepping service");
        assert_eq!(ctx.lr, stored_lr, "lr comes from the stored slot");
        assert!(ctx.flags.contains(ContextFlags::UNWOUND_TO_CALL));
        Ok(())
    }
}
