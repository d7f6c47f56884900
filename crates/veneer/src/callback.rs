//! Synchronous callback re-entry into guest code.
//!
//! A service body can invoke guest code mid-call: a new [`SyscallFrame`]
//! is linked beneath the current one and control transfers to the guest
//! callback dispatcher. The matching return does not arrive by normal
//! call/return nesting — guest code asks to return to its caller from an
//! arbitrary native call depth, so the push captures a
//! [`ContinuationPoint`] and the pop resumes it, discarding whatever the
//! native stack accumulated in between.

use std::cell::Cell;

use crate::continuation::ContinuationPoint;
use crate::context::ContextFlags;
use crate::frame::SyscallFrame;
use crate::status::Status;
use crate::thread::{MIN_SERVICE_HEADROOM, ThreadControl};

/// On-stack record for one pending callback. Lives in the issuing
/// service body's native frame; the embedded syscall frame must stay the
/// first field so the frame-stack head can double as the record pointer.
#[repr(C)]
pub(crate) struct CallbackFrame {
    pub(crate) frame: SyscallFrame,
    ret_ptr: *mut *mut u8,
    ret_len: *mut u32,
    pub(crate) point: ContinuationPoint,
    status: Cell<Status>,
}

impl CallbackFrame {
    pub(crate) fn new(ret_ptr: *mut *mut u8, ret_len: *mut u32) -> Self {
        CallbackFrame {
            frame: SyscallFrame::zeroed(),
            ret_ptr,
            ret_len,
            point: ContinuationPoint::new(),
            status: Cell::new(Status::SUCCESS),
        }
    }
}

/// Whether enough service-stack headroom remains below `record_addr` to
/// issue a callback. Refusing here keeps a deep callback chain from
/// running the service stack into its guard page unguarded.
pub(crate) fn callback_headroom_ok(control: &ThreadControl, record_addr: usize) -> bool {
    control.stack().base() + MIN_SERVICE_HEADROOM <= record_addr
}

/// Fill in and link a callback frame beneath the current one.
///
/// Reserves a 16-aligned argument area below the current frame's guest
/// SP, points the new frame at the guest callback dispatcher, and makes
/// it current. Only the integer group is marked for restore: the
/// dispatcher entry needs `r0..r2`, everything else is whatever the call
/// left. Returns the argument-area address; the caller copies the bytes
/// there (the area is guest memory, addressable only on the target).
///
/// # Safety
///
/// `record` must outlive the callback (it is resumed through).
pub(crate) unsafe fn link_callback_frame(
    control: &ThreadControl,
    record: *mut CallbackFrame,
    id: u32,
    args: u32,
    len: u32,
    dispatcher: u32,
) -> u32 {
    let current = control.current_frame();
    // SAFETY: per contract; the frame stack head always points at a live
    // frame.
    let args_data = unsafe {
        let args_data = ((*current).sp - len) & !15;
        let frame = &mut (*record).frame;
        frame.r[0] = id;
        frame.r[1] = args;
        frame.r[2] = len;
        frame.sp = args_data;
        frame.pc = dispatcher;
        frame.restore_flags = ContextFlags::INTEGER;
        frame.service_table = (*current).service_table;
        frame.prev_frame = current;
        args_data
    };
    control.set_current_frame(record as *mut SyscallFrame);
    args_data
}

/// Unlink the current callback frame, reporting its record.
///
/// Fails with `NO_CALLBACK_ACTIVE` — mutating nothing — when the current
/// frame has no predecessor, i.e. no callback is pending on this thread.
pub(crate) fn unlink_callback_frame(
    control: &ThreadControl,
) -> Result<*mut CallbackFrame, Status> {
    let record = control.current_frame() as *mut CallbackFrame;
    // SAFETY: every pushed frame is the first field of a CallbackFrame;
    // the root frame is only ever inspected, not reinterpreted further.
    let prev = unsafe { (*record).frame.prev_frame };
    if prev.is_null() {
        return Err(Status::NO_CALLBACK_ACTIVE);
    }
    control.set_current_frame(prev);
    Ok(record)
}

/// Invoke guest code synchronously from a service body.
///
/// Control comes back here only through [`pop_callback_frame`], which
/// resumes the continuation captured below — possibly from a completely
/// different native call depth.
///
/// # Safety
///
/// Must run on an initialized thread, on the service stack, with `args`
/// valid for `len` bytes and the out-pointers writable.
#[cfg(all(target_arch = "arm", target_os = "linux"))]
pub unsafe fn push_callback_frame(
    id: u32,
    args: *const u8,
    len: u32,
    ret_ptr: *mut *mut u8,
    ret_len: *mut u32,
) -> Status {
    let control = crate::thread::control();
    let mut record = CallbackFrame::new(ret_ptr, ret_len);

    if !callback_headroom_ok(control, &record as *const CallbackFrame as usize) {
        return Status::STACK_OVERFLOW;
    }

    // SAFETY: the record outlives the callback because the only exits
    // from the branch below are the resume (which lands back here) or
    // thread teardown.
    unsafe {
        if record.point.mark() == 0 {
            let args_data = link_callback_frame(
                control,
                &mut record,
                id,
                args as u32,
                len,
                crate::hooks::entries().callback_dispatcher,
            );
            std::ptr::copy_nonoverlapping(args, args_data as *mut u8, len as usize);
            crate::adapter::veneer_dispatcher_return(&mut record.frame, 0);
        }
    }
    record.status.get()
}

/// Return from the pending callback to its issuer.
///
/// The only way control returns from [`push_callback_frame`]; pops the
/// frame pushed there and resumes its continuation with the outputs
/// stored through the issuer's pointers.
///
/// # Safety
///
/// Must run on an initialized thread with a callback pending; `ret_ptr`
/// must stay valid for the issuer to read.
#[cfg(all(target_arch = "arm", target_os = "linux"))]
pub unsafe fn pop_callback_frame(ret_ptr: *mut u8, ret_len: u32, status: Status) -> Status {
    let control = crate::thread::control();
    let record = match unlink_callback_frame(control) {
        Ok(record) => record,
        Err(status) => return status,
    };
    // SAFETY: the record is the live CallbackFrame pushed by
    // push_callback_frame; its out-pointers were validated by the issuer.
    unsafe {
        *(*record).ret_ptr = ret_ptr;
        *(*record).ret_len = ret_len;
        (*record).status.set(status);
        (*record).point.resume(1)
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "linux")))]
pub unsafe fn push_callback_frame(
    _id: u32,
    _args: *const u8,
    _len: u32,
    _ret_ptr: *mut *mut u8,
    _ret_len: *mut u32,
) -> Status {
    unimplemented!("callback transfer requires the ARM adapter")
}

#[cfg(not(all(target_arch = "arm", target_os = "linux")))]
pub unsafe fn pop_callback_frame(_ret_ptr: *mut u8, _ret_len: u32, _status: Status) -> Status {
    unimplemented!("callback transfer requires the ARM adapter")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread;

    /// Number of callback frames currently pushed above the root frame.
    fn frame_depth(control: &ThreadControl) -> usize {
        let mut depth = 0;
        let mut frame = control.current_frame();
        // The chain is thread-confined and each link outlives its
        // successors; the root frame terminates it with a null prev.
        unsafe {
            while !(*frame).prev_frame.is_null() {
                depth += 1;
                frame = (*frame).prev_frame;
            }
        }
        depth
    }

    fn on_fresh_thread(f: impl FnOnce() + Send + 'static) {
        std::thread::spawn(move || {
            thread::init_thread(std::ptr::null()).unwrap();
            f();
            thread::teardown_thread();
        })
        .join()
        .unwrap();
    }

    /// Synthetic guest stack top; only the arithmetic matters here, the
    /// argument bytes are copied by the target-only path.
    const GUEST_SP: u32 = 0x7f00_0000;

    #[test]
    fn nested_frames_pop_in_reverse_issue_order() {
        on_fresh_thread(|| {
            let control = thread::control();
            assert_eq!(frame_depth(control), 0);
            control.frame().sp = GUEST_SP;

            let mut records: Vec<Box<CallbackFrame>> = Vec::new();
            for id in 0..3u32 {
                let mut record =
                    Box::new(CallbackFrame::new(std::ptr::null_mut(), std::ptr::null_mut()));
                unsafe {
                    link_callback_frame(control, &mut *record, id, 0x1000, 4, 0x4000_0000);
                }
                records.push(record);
                assert_eq!(frame_depth(control), id as usize + 1);
            }

            // Pops must come back in reverse issuance order.
            for id in (0..3u32).rev() {
                let record = unlink_callback_frame(control).unwrap();
                assert_eq!(unsafe { (*record).frame.r[0] }, id);
                assert_eq!(frame_depth(control), id as usize);
            }

            // Root frame: nothing to pop, nothing mutated.
            let root = control.current_frame();
            assert_eq!(
                unlink_callback_frame(control),
                Err(Status::NO_CALLBACK_ACTIVE)
            );
            assert_eq!(control.current_frame(), root);
        });
    }

    #[test]
    fn linked_frame_carries_dispatcher_image() {
        on_fresh_thread(|| {
            let control = thread::control();
            control.frame().sp = GUEST_SP;
            let table = 0x1234 as *const crate::frame::ServiceTable;
            control.frame().service_table = table;

            let mut record =
                Box::new(CallbackFrame::new(std::ptr::null_mut(), std::ptr::null_mut()));
            let args_data = unsafe {
                link_callback_frame(control, &mut *record, 7, 0x2000, 24, 0x4100_0001)
            };

            let frame = &record.frame;
            assert_eq!(frame.r[0], 7);
            assert_eq!(frame.r[1], 0x2000);
            assert_eq!(frame.r[2], 24);
            assert_eq!(frame.pc, 0x4100_0001);
            assert_eq!(frame.sp, args_data);
            assert_eq!(frame.sp % 16, 0, "argument area is 16-aligned");
            assert!(frame.sp <= GUEST_SP - 24);
            assert_eq!(frame.restore_flags, ContextFlags::INTEGER);
            assert_eq!(frame.service_table, table);
        });
    }

    #[test]
    fn headroom_guard_refuses_low_records() {
        on_fresh_thread(|| {
            let control = thread::control();
            let base = control.stack().base();
            assert!(!callback_headroom_ok(control, base));
            assert!(!callback_headroom_ok(control, base + MIN_SERVICE_HEADROOM - 1));
            assert!(callback_headroom_ok(control, base + MIN_SERVICE_HEADROOM));
        });
    }
}
