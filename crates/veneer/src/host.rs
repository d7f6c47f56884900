//! Mirrors of the host kernel's signal context layout, and the
//! translation between that blob and [`CpuContext`].
//!
//! The structures here match the 32-bit ARM Linux `ucontext_t` delivered
//! to an `SA_SIGINFO` handler. In-blob pointers are kept as `u32` fields
//! so the layout is exact on the target while the translation logic stays
//! a pure function over plain data (and therefore testable on any host).
//!
//! Architecture extensions (the VFP register file) ride behind the base
//! context in a self-describing chain of `{magic, size}` records inside
//! `reg_space`. The chain is scanned, never trusted: a corrupt record
//! terminates the walk at the end of the blob rather than running past it.

use std::mem;
use std::ptr;

use crate::context::{CPSR_ALT_ENCODING, ContextFlags, CpuContext};

/// Tag of the VFP extension record in the signal-context chain.
pub(crate) const VFP_MAGIC: u32 = 0x5646_5001;

/// Machine context embedded in [`HostContext`].
#[derive(Clone, Copy)]
#[repr(C)]
pub struct SigContext {
    pub trap_no: u32,
    pub error_code: u32,
    pub oldmask: u32,
    /// r0..r10.
    pub r: [u32; 11],
    pub fp: u32,
    pub ip: u32,
    pub sp: u32,
    pub lr: u32,
    pub pc: u32,
    pub cpsr: u32,
    pub fault_address: u32,
}

/// Write-access bit of `error_code` on a memory fault.
pub(crate) const ERROR_CODE_WRITE: u32 = 0x800;

#[derive(Clone, Copy)]
#[repr(C)]
pub struct HostStack {
    pub ss_sp: u32,
    pub ss_flags: i32,
    pub ss_size: u32,
}

/// The full signal context blob.
///
/// Valid only within the dynamic extent of the signal handler it was
/// delivered to; nothing in this crate retains one.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct HostContext {
    pub flags: u32,
    pub link: u32,
    pub stack: HostStack,
    pub mcontext: SigContext,
    pub sigmask: [u64; 16],
    /// Extension record chain ({magic, size} framed).
    pub reg_space: [u64; 64],
}

impl HostContext {
    /// All-zero blob: empty register state, empty extension chain.
    pub const fn zeroed() -> Self {
        HostContext {
            flags: 0,
            link: 0,
            stack: HostStack {
                ss_sp: 0,
                ss_flags: 0,
                ss_size: 0,
            },
            mcontext: SigContext {
                trap_no: 0,
                error_code: 0,
                oldmask: 0,
                r: [0; 11],
                fp: 0,
                ip: 0,
                sp: 0,
                lr: 0,
                pc: 0,
                cpsr: 0,
                fault_address: 0,
            },
            sigmask: [0; 16],
            reg_space: [0; 64],
        }
    }
}

/// VFP extension record: 32 double registers plus the status word.
#[derive(Clone, Copy)]
#[repr(C)]
struct VfpRecord {
    magic: u32,
    size: u32,
    d: [u64; 32],
    fpscr: u32,
}

/// Locate an extension record by tag.
///
/// Returns a pointer into `uc.reg_space`, possibly underaligned for the
/// record type; callers go through unaligned reads/writes. The scan is
/// bounded by the end of the blob, so a corrupt chain cannot walk out of
/// it.
fn find_extension(uc: &HostContext, magic: u32) -> Option<*const u8> {
    let base = uc.reg_space.as_ptr() as usize;
    let end = uc as *const HostContext as usize + mem::size_of::<HostContext>();
    let mut offset = base;

    while offset + 8 <= end {
        let header = unsafe { ptr::read_unaligned(offset as *const [u32; 2]) };
        let (tag, size) = (header[0], header[1]);
        if tag == 0 || size == 0 {
            return None;
        }
        if tag == magic {
            return Some(offset as *const u8);
        }
        offset = offset.checked_add(size as usize)?;
    }
    None
}

fn capture_vfp(ctx: &mut CpuContext, uc: &HostContext) {
    let Some(record) = find_extension(uc, VFP_MAGIC) else {
        return;
    };
    // SAFETY: find_extension only returns pointers with the full record
    // header in bounds; a truncated record would have reported a smaller
    // chain and been skipped at the {magic, size} check.
    let vfp = unsafe { ptr::read_unaligned(record as *const VfpRecord) };
    ctx.d = vfp.d;
    ctx.fpscr = vfp.fpscr;
    ctx.flags |= ContextFlags::FLOAT;
}

fn apply_vfp(ctx: &CpuContext, uc: &mut HostContext) {
    if !ctx.flags.contains(ContextFlags::FLOAT) {
        return;
    }
    let Some(record) = find_extension(uc, VFP_MAGIC) else {
        // No extension block in this blob; nothing to rewrite.
        return;
    };
    let record = record as *mut VfpRecord;
    // SAFETY: same bounds argument as capture_vfp; the record lives
    // inside `uc`, which we hold mutably.
    unsafe {
        let mut vfp = ptr::read_unaligned(record);
        vfp.d = ctx.d;
        vfp.fpscr = ctx.fpscr;
        ptr::write_unaligned(record, vfp);
    }
}

/// Capture the full guest-visible register state from a host blob.
///
/// The validity mask reports exactly what was captured: CONTROL and
/// INTEGER always, FLOAT only when the blob carries a VFP record. Fields
/// outside the mask are left untouched, not zeroed.
pub fn capture(uc: &HostContext) -> CpuContext {
    let mut ctx = CpuContext::zeroed();
    capture_into(&mut ctx, uc);
    ctx
}

/// Capture into an existing context, preserving unrelated fields.
pub fn capture_into(ctx: &mut CpuContext, uc: &HostContext) {
    let mc = &uc.mcontext;

    ctx.r[..11].copy_from_slice(&mc.r);
    ctx.r[11] = mc.fp;
    ctx.r[12] = mc.ip;
    ctx.sp = mc.sp;
    ctx.lr = mc.lr;
    ctx.pc = mc.pc;
    ctx.cpsr = mc.cpsr;
    if mc.cpsr & CPSR_ALT_ENCODING != 0 {
        ctx.pc |= 1;
    }
    ctx.flags |= ContextFlags::CONTROL | ContextFlags::INTEGER;

    capture_vfp(ctx, uc);
}

/// Write a context back into a host blob; the inverse of [`capture`].
///
/// The execution-state bit of CPSR is re-derived from the target PC's low
/// bit rather than trusted from the context. VFP write-back rewrites an
/// existing extension record only; if the blob has none it is skipped.
pub fn apply(ctx: &CpuContext, uc: &mut HostContext) {
    let mc = &mut uc.mcontext;

    mc.r.copy_from_slice(&ctx.r[..11]);
    mc.fp = ctx.r[11];
    mc.ip = ctx.r[12];
    mc.sp = ctx.sp;
    mc.lr = ctx.lr;
    mc.pc = ctx.pc;
    mc.cpsr = ctx.cpsr;
    if mc.pc & 1 != 0 {
        mc.cpsr |= CPSR_ALT_ENCODING;
    } else {
        mc.cpsr &= !CPSR_ALT_ENCODING;
    }

    apply_vfp(ctx, uc);
}
