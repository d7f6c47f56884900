mod adapter;
#[cfg_attr(not(all(target_arch = "arm", target_os = "linux")), allow(dead_code))]
mod callback;
#[cfg_attr(not(all(target_arch = "arm", target_os = "linux")), allow(dead_code))]
mod classify;
mod context;
#[cfg_attr(not(all(target_arch = "arm", target_os = "linux")), allow(dead_code))]
mod continuation;
#[cfg_attr(not(all(target_arch = "arm", target_os = "linux")), allow(dead_code))]
mod dispatch;
mod exception;
mod frame;
#[cfg_attr(not(all(target_arch = "arm", target_os = "linux")), allow(dead_code))]
mod hooks;
mod host;
#[cfg_attr(not(all(target_arch = "arm", target_os = "linux")), allow(dead_code))]
mod signals;
mod status;
#[cfg_attr(not(all(target_arch = "arm", target_os = "linux")), allow(dead_code))]
mod thread;
mod unwind;

pub use callback::{pop_callback_frame, push_callback_frame};
pub use context::{ContextFlags, CpuContext};
#[cfg(all(target_arch = "arm", target_os = "linux"))]
pub use dispatch::with_fault_recovery;
pub use dispatch::{
    call_guest_apc, call_guest_exception_dispatcher, call_guest_raise_exception,
    exit_current_thread, read_thread_context, service_entry_point, set_full_thread_context,
    start_thread, write_thread_context,
};
pub use exception::{ExceptionRecord, RecordFlags};
pub use frame::{
    MIN_SPILL_BYTES, ServiceTable, SyscallFrame, argument_spill_base, lookup_service,
    service_id_entry, service_id_table,
};
pub use hooks::{DebugDisposition, GuestEntryPoints, HostHooks, init_process};
pub use host::{HostContext, HostStack, SigContext, apply, capture, capture_into};
pub use status::Status;
pub use thread::{init_thread, teardown_thread};
pub use unwind::{
    DispatchInfo, FrameInfo, FrameStepper, StepError, UnwindReg, raise_guest_exception,
    raise_trampoline_entry, unwind_one_frame,
};
