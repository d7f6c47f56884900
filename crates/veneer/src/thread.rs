//! Per-thread state: the service stack, the frame stack head, and the
//! explicit thread lifecycle.
//!
//! Each guest thread owns a dedicated, guarded service stack. Service
//! bodies and callback bookkeeping run on it; the thread's root
//! [`SyscallFrame`] occupies its top. All of this is thread-confined —
//! nothing here is shared across threads, so no locks.

use std::cell::{Cell, UnsafeCell};
use std::ptr;

use crate::continuation::ContinuationPoint;
use crate::frame::{ServiceTable, SyscallFrame};

/// Usable service stack size per thread.
const SERVICE_STACK_SIZE: usize = 256 * 1024;

/// Guard page count below the usable region.
const GUARD_PAGES: usize = 1;

/// Alternate signal stack size. Signal handlers must run even with the
/// guest stack exhausted.
const ALT_STACK_SIZE: usize = 64 * 1024;

/// Minimum service-stack headroom required to issue a callback.
pub(crate) const MIN_SERVICE_HEADROOM: usize = 16 * 1024;

fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) always succeeds on POSIX systems.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Mmap'd service stack with a guard page at the bottom.
///
/// Layout (grows downward):
/// ```text
/// [guard]  [usable .................. root frame]
///  NONE     READ|WRITE                ^top
///  ^mmap_base
/// ```
///
/// A runaway service body that overruns the usable region hits the guard
/// page and faults instead of silently corrupting the allocation below.
pub(crate) struct ServiceStack {
    mmap_base: *mut u8,
    mmap_size: usize,
    base: *mut u8,
    size: usize,
}

impl ServiceStack {
    fn new() -> Result<Self, anyhow::Error> {
        let page_size = page_size();
        let guard_size = GUARD_PAGES * page_size;
        let total_size = SERVICE_STACK_SIZE + guard_size;

        unsafe {
            let ptr = libc::mmap(
                ptr::null_mut(),
                total_size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            anyhow::ensure!(ptr != libc::MAP_FAILED, "service stack mmap failed");

            let usable = (ptr as *mut u8).add(guard_size);
            let ret = libc::mprotect(
                usable as *mut libc::c_void,
                SERVICE_STACK_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
            );
            if ret != 0 {
                libc::munmap(ptr, total_size);
                anyhow::bail!("service stack mprotect failed");
            }

            Ok(ServiceStack {
                mmap_base: ptr as *mut u8,
                mmap_size: total_size,
                base: usable,
                size: SERVICE_STACK_SIZE,
            })
        }
    }

    /// Bottom of the usable region.
    pub(crate) fn base(&self) -> usize {
        self.base as usize
    }

    /// Top of the usable region (exclusive).
    pub(crate) fn top(&self) -> usize {
        self.base as usize + self.size
    }
}

impl Drop for ServiceStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mmap_base as *mut libc::c_void, self.mmap_size);
        }
    }
}

/// Per-thread control block.
///
/// `repr(C)` because the first two fields are part of the adapter's
/// fixed layout contract: the dispatcher assembly reaches the current
/// frame pointer at offset 0 and the parked exit SP at offset 4 through
/// the published thread-control address.
#[repr(C)]
pub(crate) struct ThreadControl {
    /// Most recent syscall frame; the head of the frame stack.
    current_frame: Cell<*mut SyscallFrame>,
    /// Native SP parked at thread entry, consumed by the exit path.
    exit_frame: Cell<usize>,
    /// Armed recovery point for faults inside fragile service-path
    /// memory accesses; null when disarmed.
    recovery: Cell<*mut ContinuationPoint>,
    stack: ServiceStack,
    alt_stack: *mut u8,
}

#[cfg(target_arch = "arm")]
const _: () = {
    assert!(core::mem::offset_of!(ThreadControl, current_frame) == 0);
    assert!(core::mem::offset_of!(ThreadControl, exit_frame) == 4);
};

impl ThreadControl {
    pub(crate) fn current_frame(&self) -> *mut SyscallFrame {
        self.current_frame.get()
    }

    pub(crate) fn set_current_frame(&self, frame: *mut SyscallFrame) {
        self.current_frame.set(frame);
    }

    /// The frame the dispatcher is executing on behalf of. Panics if the
    /// thread has no frame, which would mean lifecycle misuse.
    pub(crate) fn frame(&self) -> &mut SyscallFrame {
        let frame = self.current_frame.get();
        assert!(!frame.is_null(), "no active syscall frame");
        // SAFETY: frames are thread-confined and live until popped; the
        // head pointer is only ever set to a live frame.
        unsafe { &mut *frame }
    }

    pub(crate) fn exit_frame(&self) -> usize {
        self.exit_frame.get()
    }

    pub(crate) fn set_exit_frame(&self, sp: usize) {
        self.exit_frame.set(sp);
    }

    pub(crate) fn recovery(&self) -> *mut ContinuationPoint {
        self.recovery.get()
    }

    pub(crate) fn set_recovery(&self, point: *mut ContinuationPoint) {
        self.recovery.set(point);
    }

    pub(crate) fn stack(&self) -> &ServiceStack {
        &self.stack
    }

    /// Whether a host stack pointer lies inside the service-call region:
    /// on the service stack, at or below the current frame.
    pub(crate) fn inside_service_call(&self, sp: usize) -> bool {
        sp >= self.stack.base() && sp <= self.current_frame.get() as usize
    }
}

thread_local! {
    static CONTROL: UnsafeCell<Option<Box<ThreadControl>>> =
        const { UnsafeCell::new(None) };
}

/// Initialize this thread's control block: service stack, root frame,
/// and alternate signal stack. Must run once per guest thread before any
/// service call or fault can be handled on it.
pub fn init_thread(service_table: *const ServiceTable) -> Result<(), anyhow::Error> {
    CONTROL.with(|cell| {
        let slot = unsafe { &mut *cell.get() };
        anyhow::ensure!(slot.is_none(), "thread already initialized");

        let stack = ServiceStack::new()?;

        // The root frame lives in the top of the service stack.
        let root = (stack.top() - size_of::<SyscallFrame>()) as *mut SyscallFrame;
        unsafe {
            root.write(SyscallFrame::zeroed());
            (*root).service_table = service_table;
        }

        let alt_stack = install_alt_stack()?;

        let control = Box::new(ThreadControl {
            current_frame: Cell::new(root),
            exit_frame: Cell::new(0),
            recovery: Cell::new(ptr::null_mut()),
            stack,
            alt_stack,
        });
        crate::adapter::publish_thread_control(&control);
        *slot = Some(control);
        Ok(())
    })
}

/// Release this thread's control block. Any frames still pushed are
/// abandoned; callers on the orderly path have already unwound them.
pub fn teardown_thread() {
    CONTROL.with(|cell| {
        let slot = unsafe { &mut *cell.get() };
        if let Some(control) = slot.take() {
            unsafe {
                // Unregister before unmapping so a late signal cannot land
                // on a stale stack.
                let ss = libc::stack_t {
                    ss_sp: ptr::null_mut(),
                    ss_flags: libc::SS_DISABLE,
                    ss_size: 0,
                };
                libc::sigaltstack(&ss, ptr::null_mut());
                libc::munmap(control.alt_stack as *mut libc::c_void, ALT_STACK_SIZE);
            }
        }
    });
}

/// This thread's control block. Panics when the thread was never
/// initialized — every caller is past the point where that is a
/// programming error, not a recoverable condition.
pub(crate) fn control() -> &'static ThreadControl {
    try_control().expect("thread not initialized")
}

/// Non-panicking accessor for signal handlers, which may fire on threads
/// this layer does not manage.
pub(crate) fn try_control() -> Option<&'static ThreadControl> {
    CONTROL.with(|cell| {
        let slot = unsafe { &*cell.get() };
        // SAFETY: the box's address is stable until teardown_thread, and
        // the reference never crosses a thread boundary.
        slot.as_deref()
            .map(|control| unsafe { &*(control as *const ThreadControl) })
    })
}

fn install_alt_stack() -> Result<*mut u8, anyhow::Error> {
    unsafe {
        let alt_stack = libc::mmap(
            ptr::null_mut(),
            ALT_STACK_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        anyhow::ensure!(alt_stack != libc::MAP_FAILED, "alt stack mmap failed");

        let ss = libc::stack_t {
            ss_sp: alt_stack,
            ss_flags: 0,
            ss_size: ALT_STACK_SIZE,
        };
        if libc::sigaltstack(&ss, ptr::null_mut()) != 0 {
            libc::munmap(alt_stack, ALT_STACK_SIZE);
            anyhow::bail!("sigaltstack failed");
        }
        Ok(alt_stack as *mut u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_and_root_frame() -> Result<(), anyhow::Error> {
        std::thread::spawn(|| -> Result<(), anyhow::Error> {
            init_thread(ptr::null())?;
            let control = control();
            let root = control.current_frame();
            assert!(!root.is_null());
            assert_eq!(root as usize + size_of::<SyscallFrame>(), control.stack.top());
            unsafe {
                assert!((*root).prev_frame.is_null());
            }

            // SP below the stack, above the frame, or on another region
            // is outside the service-call window.
            assert!(control.inside_service_call(root as usize));
            assert!(control.inside_service_call(control.stack.base()));
            assert!(!control.inside_service_call(control.stack.base() - 1));
            assert!(!control.inside_service_call(root as usize + 0x200));

            // Exit/recovery slots start clear.
            assert_eq!(control.exit_frame(), 0);
            assert!(control.recovery().is_null());
            control.set_exit_frame(0x1234);
            assert_eq!(control.exit_frame(), 0x1234);

            teardown_thread();
            assert!(try_control().is_none());
            Ok(())
        })
        .join()
        .unwrap()
    }

    #[test]
    fn accessor_panics_before_init() {
        let result = std::thread::spawn(|| {
            let caught = std::panic::catch_unwind(|| {
                let _ = control();
            });
            caught.is_err()
        })
        .join()
        .unwrap();
        assert!(result);
    }
}
