use bitflags::bitflags;

bitflags! {
    /// Register-group validity/restore mask.
    ///
    /// On a captured context the bits record which groups hold live
    /// values; on a restore they select which groups are written back.
    /// `UNWOUND_TO_CALL` marks a context produced by stepping to a call
    /// boundary rather than by a fault snapshot.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    #[repr(transparent)]
    pub struct ContextFlags: u32 {
        const CONTROL = 0x1;
        const INTEGER = 0x2;
        const FLOAT = 0x4;
        const UNWOUND_TO_CALL = 0x2000_0000;
    }
}

impl ContextFlags {
    pub const FULL: ContextFlags = ContextFlags::CONTROL
        .union(ContextFlags::INTEGER)
        .union(ContextFlags::FLOAT);
}

/// Canonical snapshot of the guest-visible CPU state.
///
/// `r[0..=12]` are the general-purpose registers (`r[11]` frame pointer,
/// `r[12]` intra-procedure scratch). The program counter carries the
/// alternate instruction-encoding state in its low bit, mirrored from
/// CPSR bit 5.
///
/// Readers must consult `flags` before trusting a register group: a group
/// absent from the mask is unspecified, not zero.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct CpuContext {
    pub flags: ContextFlags,
    pub r: [u32; 13],
    pub sp: u32,
    pub lr: u32,
    pub pc: u32,
    pub cpsr: u32,
    pub fpscr: u32,
    pub d: [u64; 32],
}

/// CPSR bit selecting the alternate (halfword) instruction encoding.
pub(crate) const CPSR_ALT_ENCODING: u32 = 0x20;

impl CpuContext {
    pub const fn zeroed() -> Self {
        CpuContext {
            flags: ContextFlags::empty(),
            r: [0; 13],
            sp: 0,
            lr: 0,
            pc: 0,
            cpsr: 0,
            fpscr: 0,
            d: [0; 32],
        }
    }
}

impl Default for CpuContext {
    fn default() -> Self {
        CpuContext::zeroed()
    }
}
