use bitflags::bitflags;

use crate::status::Status;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    #[repr(transparent)]
    pub struct RecordFlags: u32 {
        /// The faulting state must not be resumed; the guest dispatcher
        /// may only unwind past it.
        const NONCONTINUABLE = 0x1;
    }
}

/// Exception record handed to the guest dispatcher.
///
/// Built once per fault or instrumented event and immutable afterwards;
/// crosses into guest code by copy inside the transfer block.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct ExceptionRecord {
    pub code: Status,
    pub flags: RecordFlags,
    /// Faulting instruction address (guest PC at the time of the trap).
    pub address: u32,
    pub param_count: u32,
    pub params: [u32; 2],
}

impl ExceptionRecord {
    pub const fn new(code: Status) -> Self {
        ExceptionRecord {
            code,
            flags: RecordFlags::empty(),
            address: 0,
            param_count: 0,
            params: [0; 2],
        }
    }

    pub const fn noncontinuable(code: Status) -> Self {
        let mut rec = ExceptionRecord::new(code);
        rec.flags = RecordFlags::NONCONTINUABLE;
        rec
    }
}
