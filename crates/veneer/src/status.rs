use std::fmt;

/// Guest ABI status code.
///
/// Statuses and exception codes share one numeric space: the top two bits
/// encode severity (00 success, 01 informational, 10 warning, 11 error).
/// Protocol results and `ExceptionRecord::code` both carry this type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Status(pub u32);

impl Status {
    pub const SUCCESS: Status = Status(0);

    // Warning-severity exception codes.
    pub const GUARD_PAGE: Status = Status(0x8000_0001);
    pub const DATATYPE_MISALIGNMENT: Status = Status(0x8000_0002);
    pub const BREAKPOINT: Status = Status(0x8000_0003);
    pub const SINGLE_STEP: Status = Status(0x8000_0004);

    // Error-severity exception codes.
    pub const ACCESS_VIOLATION: Status = Status(0xC000_0005);
    pub const IN_PAGE_ERROR: Status = Status(0xC000_0006);
    pub const ILLEGAL_INSTRUCTION: Status = Status(0xC000_001D);
    pub const ARRAY_BOUNDS_EXCEEDED: Status = Status(0xC000_008C);
    pub const FLT_DENORMAL_OPERAND: Status = Status(0xC000_008D);
    pub const FLT_DIVIDE_BY_ZERO: Status = Status(0xC000_008E);
    pub const FLT_INEXACT_RESULT: Status = Status(0xC000_008F);
    pub const FLT_INVALID_OPERATION: Status = Status(0xC000_0090);
    pub const FLT_OVERFLOW: Status = Status(0xC000_0091);
    pub const FLT_UNDERFLOW: Status = Status(0xC000_0093);
    pub const INT_DIVIDE_BY_ZERO: Status = Status(0xC000_0094);
    pub const INT_OVERFLOW: Status = Status(0xC000_0095);
    pub const ASSERTION_FAILURE: Status = Status(0xC000_0420);

    // Protocol statuses.
    pub const INVALID_PARAMETER: Status = Status(0xC000_000D);
    pub const INVALID_DISPOSITION: Status = Status(0xC000_0026);
    pub const STACK_OVERFLOW: Status = Status(0xC000_00FD);
    pub const NO_CALLBACK_ACTIVE: Status = Status(0xC000_0258);

    #[inline]
    pub fn is_success(self) -> bool {
        self == Status::SUCCESS
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status({:#010x})", self.0)
    }
}
