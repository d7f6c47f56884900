//! External collaborators, consumed through narrow contracts.
//!
//! Everything the boundary layer cannot decide on its own — page-fault
//! resolution, debugger transport, suspend coordination, thread teardown —
//! is supplied once at process initialization and read-only afterwards, so
//! the signal handlers can reach it without locking.

use std::sync::OnceLock;

use crate::context::CpuContext;
use crate::exception::ExceptionRecord;
use crate::status::Status;

/// Debugger verdict on a first- or second-chance exception.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DebugDisposition {
    /// Resume the faulting context unchanged.
    Continue,
    /// The debugger fixed the cause; resume unchanged.
    Handled,
    /// Deliver the exception to guest code.
    NotHandled,
}

/// Host-side services the boundary layer calls out to.
///
/// Implementations must be callable from a signal handler: no allocation,
/// no locks shared with interrupted code.
pub trait HostHooks: Sync {
    /// Offer an exception to an attached debugger before (first chance)
    /// or after (second chance) in-process handling.
    fn notify_debugger(
        &self,
        record: &ExceptionRecord,
        context: &CpuContext,
        first_chance: bool,
    ) -> DebugDisposition;

    /// Try to resolve a memory fault transparently (guard-page growth,
    /// copy-on-write). `Status::SUCCESS` means resolved: no exception
    /// surfaces and the faulting code resumes unmodified.
    fn resolve_fault(&self, addr: u32, is_write: bool, stack_ptr: u32) -> Status;

    /// Block until a pending suspend request for this thread clears. The
    /// suspender may rewrite the context while the thread waits.
    fn wait_suspend(&self, context: &mut CpuContext);

    /// An interrupt request (SIGINT) arrived for the process.
    fn on_interrupt(&self);

    /// Tear the current thread down, bypassing frame bookkeeping.
    fn abort_thread(&self, code: u32) -> !;
}

/// Guest code addresses control is transferred to.
///
/// All are guest-ABI entry points; the low PC bit selects the alternate
/// instruction encoding as usual.
#[derive(Clone, Copy, Debug)]
pub struct GuestEntryPoints {
    /// Structured-exception dispatcher: `(record, context)`.
    pub exception_dispatcher: u32,
    /// Callback dispatcher: `(id, args, len)`.
    pub callback_dispatcher: u32,
    /// Asynchronous-procedure dispatcher: `(context, arg1, arg2, arg3)`.
    pub apc_dispatcher: u32,
    /// Deferred user-exception raise entry.
    pub raise_exception_dispatcher: u32,
    /// Per-thread guest initialization entry: `(context)`. Runs first on
    /// a new thread and continues into the context's PC.
    pub thread_init_dispatcher: u32,
    /// First guest instruction of a new thread's user code.
    pub thread_start: u32,
}

static HOOKS: OnceLock<&'static dyn HostHooks> = OnceLock::new();
static ENTRIES: OnceLock<GuestEntryPoints> = OnceLock::new();

/// Register collaborators and install the process signal handlers.
///
/// Must run once, before any thread calls [`crate::init_thread`].
pub fn init_process(
    hooks: &'static dyn HostHooks,
    entries: GuestEntryPoints,
) -> Result<(), anyhow::Error> {
    anyhow::ensure!(HOOKS.set(hooks).is_ok(), "process already initialized");
    let _ = ENTRIES.set(entries);
    crate::signals::install()?;
    log::trace!("boundary layer initialized");
    Ok(())
}

/// Fails loudly when called before [`init_process`]: every caller is on a
/// path that cannot proceed without its collaborators.
pub(crate) fn hooks() -> &'static dyn HostHooks {
    *HOOKS.get().expect("host hooks not registered")
}

pub(crate) fn entries() -> &'static GuestEntryPoints {
    ENTRIES.get().expect("guest entry points not registered")
}
