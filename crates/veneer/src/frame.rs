//! The per-thread service frame: one level of guest/host re-entrancy.
//!
//! A `SyscallFrame` holds the guest register image saved on service-call
//! entry plus the bookkeeping the dispatcher needs to return. Frames form
//! an intrusive singly linked stack, most recent on top; the stack depth
//! equals the number of callback re-entries currently in flight on the
//! thread.
//!
//! The layout is part of the calling-convention adapter's fixed contract
//! (see `adapter`): field offsets are compile-time asserted on the target
//! and must not change without updating the dispatcher assembly.

use crate::context::{CPSR_ALT_ENCODING, ContextFlags, CpuContext};
use crate::status::Status;

/// One entry of the active service table set.
///
/// `entries` and `arg_bytes` are parallel arrays of `limit` elements:
/// the operation body and its declared argument size in bytes.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct ServiceTable {
    pub entries: *const usize,
    /// Reserved counter array slot (keeps the 16-byte table stride).
    pub counters: *const usize,
    pub limit: u32,
    pub arg_bytes: *const u8,
}

/// Saved register state + bookkeeping for one service-call entry.
#[repr(C)]
pub struct SyscallFrame {
    /// r0..r12 at 0x00.
    pub r: [u32; 13],
    /// Resume PC at 0x34.
    pub pc: u32,
    /// Caller SP at 0x38.
    pub sp: u32,
    /// Caller LR at 0x3c.
    pub lr: u32,
    /// CPSR at 0x40.
    pub cpsr: u32,
    /// Register groups to write back on return, at 0x44.
    pub restore_flags: ContextFlags,
    /// FP status word at 0x48.
    pub fpscr: u32,
    /// Next-older frame, at 0x4c; null on the thread's root frame.
    pub prev_frame: *mut SyscallFrame,
    /// Active service table set (array of 4), at 0x50.
    pub service_table: *const ServiceTable,
    pub align: [u32; 3],
    /// FP register file at 0x60.
    pub d: [u64; 32],
}

#[cfg(target_arch = "arm")]
const _: () = {
    assert!(size_of::<SyscallFrame>() == 0x160);
    assert!(core::mem::offset_of!(SyscallFrame, pc) == 0x34);
    assert!(core::mem::offset_of!(SyscallFrame, restore_flags) == 0x44);
    assert!(core::mem::offset_of!(SyscallFrame, prev_frame) == 0x4c);
    assert!(core::mem::offset_of!(SyscallFrame, service_table) == 0x50);
    assert!(core::mem::offset_of!(SyscallFrame, d) == 0x60);
    assert!(size_of::<ServiceTable>() == 0x10);
};

impl SyscallFrame {
    pub const fn zeroed() -> Self {
        SyscallFrame {
            r: [0; 13],
            pc: 0,
            sp: 0,
            lr: 0,
            cpsr: 0,
            restore_flags: ContextFlags::empty(),
            fpscr: 0,
            prev_frame: core::ptr::null_mut(),
            service_table: core::ptr::null(),
            align: [0; 3],
            d: [0; 32],
        }
    }
}

/// Table selector from a packed service id (bits 12–13).
#[inline]
pub fn service_id_table(id: u32) -> usize {
    ((id >> 12) & 0x3) as usize
}

/// Entry index from a packed service id (bits 0–11).
#[inline]
pub fn service_id_entry(id: u32) -> usize {
    (id & 0xfff) as usize
}

/// Minimum argument-spill area, in bytes. The dispatcher pops the first
/// four argument words back into registers from this area, so it can
/// never be smaller than four machine words.
pub const MIN_SPILL_BYTES: u32 = 16;

/// Base address of the argument-spill area for a service call with the
/// given declared argument size. Part of the service ABI: guest-side
/// stub generators must leave this much room below the caller's SP.
///
/// Clamps the declared size up to [`MIN_SPILL_BYTES`] and aligns the
/// result down to 8, matching the dispatcher's allocation.
#[inline]
pub fn argument_spill_base(sp: u32, declared_bytes: u32) -> u32 {
    (sp - declared_bytes.max(MIN_SPILL_BYTES)) & !7
}

/// Resolve a packed service id against the active table set.
///
/// Returns the operation body address and its declared argument size, or
/// `INVALID_PARAMETER` for an out-of-range index. Mirrors the dispatcher
/// assembly's lookup; the error path touches no register state.
///
/// # Safety
///
/// `tables` must point to an array of four valid `ServiceTable`s whose
/// `entries`/`arg_bytes` arrays cover `limit` elements.
pub unsafe fn lookup_service(
    tables: *const ServiceTable,
    id: u32,
) -> Result<(usize, u32), Status> {
    // SAFETY: the selector is masked to the four-table set the caller
    // guarantees; the entry index is bounds-checked against the table.
    unsafe {
        let table = &*tables.add(service_id_table(id));
        let index = service_id_entry(id);
        if index >= table.limit as usize {
            return Err(Status::INVALID_PARAMETER);
        }
        let body = *table.entries.add(index);
        let bytes = *table.arg_bytes.add(index) as u32;
        Ok((body, bytes))
    }
}

/// Copy the requested register groups out of a frame.
///
/// `ctx.flags` selects the groups on entry; on return it reports the
/// groups actually read (all requested groups — a frame always holds a
/// full image).
pub(crate) fn read_frame_context(frame: &SyscallFrame, ctx: &mut CpuContext) {
    let needed = ctx.flags;
    if needed.contains(ContextFlags::INTEGER) {
        ctx.r = frame.r;
    }
    if needed.contains(ContextFlags::CONTROL) {
        ctx.sp = frame.sp;
        ctx.lr = frame.lr;
        ctx.pc = frame.pc;
        ctx.cpsr = frame.cpsr;
    }
    if needed.contains(ContextFlags::FLOAT) {
        ctx.fpscr = frame.fpscr;
        ctx.d = frame.d;
    }
}

/// Copy the valid register groups of `ctx` into a frame and merge the
/// written groups into its restore mask.
///
/// INTEGER is deliberately left out of the merge: r0 carries the service
/// status on the normal return path, and restoring the integer group is
/// opted into explicitly (see `set_full_thread_context`).
pub(crate) fn write_frame_context(frame: &mut SyscallFrame, ctx: &CpuContext) {
    let flags = ctx.flags;
    if flags.contains(ContextFlags::INTEGER) {
        frame.r = ctx.r;
    }
    if flags.contains(ContextFlags::CONTROL) {
        frame.sp = ctx.sp;
        frame.lr = ctx.lr;
        frame.cpsr = ctx.cpsr;
        frame.pc = ctx.pc & !1;
        if ctx.cpsr & CPSR_ALT_ENCODING != 0 {
            frame.pc |= 1;
        }
    }
    if flags.contains(ContextFlags::FLOAT) {
        frame.fpscr = ctx.fpscr;
        frame.d = ctx.d;
    }
    frame.restore_flags |= flags & (ContextFlags::CONTROL | ContextFlags::FLOAT);
}
