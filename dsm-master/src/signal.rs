//! Access-violation signal interception. The handler itself does only
//! async-signal-safe work (writing an already-computed address into an
//! atomic and a single byte into a pipe); everything else — acquiring the
//! global lock, walking the thread list, talking to the transport — runs on
//! a dedicated fault-service thread that wakes on that pipe.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use crate::error::MasterError;

pub const ACCESS_VIOLATION_SIGNAL: i32 = libc::SIGSEGV;

static FAULT_ADDR: AtomicUsize = AtomicUsize::new(0);
static WAKE_WRITE_FD: AtomicUsize = AtomicUsize::new(usize::MAX);

/// The disposition that was in effect before `install` ran, so a fault the
/// core doesn't own (outside the managed region) can be handed back to
/// whatever would have handled it otherwise.
static PREVIOUS_ACTION: OnceLock<libc::sigaction> = OnceLock::new();

extern "C" fn handle_access_violation(
    _signum: libc::c_int,
    info: *mut libc::siginfo_t,
    _ucontext: *mut libc::c_void,
) {
    let addr = unsafe { (*info).si_addr() } as usize;
    FAULT_ADDR.store(addr, Ordering::SeqCst);
    let fd = WAKE_WRITE_FD.load(Ordering::SeqCst) as RawFd;
    if fd >= 0 {
        let byte: u8 = 1;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// A self-pipe the fault-service thread blocks on; `read_fd` is handed to
/// that thread, `write_fd` is stashed for the signal handler.
pub struct WakePipe {
    pub read_fd: RawFd,
}

/// Install the access-violation handler and wire up the wake pipe. Must be
/// called once, before any user thread can fault.
pub fn install(_extra: ()) -> Result<WakePipe, MasterError> {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        let errno = unsafe { *libc::__errno_location() };
        return Err(MasterError::PipeFailed { errno });
    }
    WAKE_WRITE_FD.store(fds[1] as usize, Ordering::SeqCst);

    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handle_access_violation as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
    }

    let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::sigaction(ACCESS_VIOLATION_SIGNAL, &action, &mut previous) };
    if rc != 0 {
        let errno = unsafe { *libc::__errno_location() };
        return Err(MasterError::SigactionFailed { errno });
    }
    let _ = PREVIOUS_ACTION.set(previous);

    Ok(WakePipe { read_fd: fds[0] })
}

/// A fault address outside the managed region is a genuine bug in the user
/// program, not anything the paging engine is responsible for: restore
/// whatever disposition was in effect before `install` ran and re-deliver
/// the signal to `tid` so it gets the outcome it would have gotten without
/// this process ever intercepting `SIGSEGV` (typically termination with a
/// core dump under the default disposition).
pub fn restore_previous_and_reraise(tid: libc::pid_t) {
    let restored = match PREVIOUS_ACTION.get() {
        Some(prev) => unsafe { libc::sigaction(ACCESS_VIOLATION_SIGNAL, prev, std::ptr::null_mut()) },
        None => {
            let mut dfl: libc::sigaction = unsafe { std::mem::zeroed() };
            dfl.sa_sigaction = libc::SIG_DFL;
            unsafe { libc::sigaction(ACCESS_VIOLATION_SIGNAL, &dfl, std::ptr::null_mut()) }
        }
    };
    if restored != 0 {
        let errno = unsafe { *libc::__errno_location() };
        tracing::error!(errno, "could not restore the previous SIGSEGV disposition");
    }
    unsafe {
        libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, ACCESS_VIOLATION_SIGNAL);
    }
}

/// Block until the next fault wakes this thread, then return the faulting
/// address recorded by the handler.
pub fn wait_for_fault(wake: &WakePipe) -> usize {
    let mut byte = [0u8; 1];
    unsafe {
        libc::read(wake.read_fd, byte.as_mut_ptr() as *mut libc::c_void, 1);
    }
    FAULT_ADDR.load(Ordering::SeqCst)
}

/// Deliver the access-violation signal to a specific OS thread, used to
/// freeze peer user threads during fault service. Returns `false` if the
/// target no longer exists (`ESRCH`), which the freeze wave treats as "this
/// thread is dead, drop it from the registry" rather than an error.
pub fn freeze_thread(tid: libc::pid_t) -> bool {
    let rc = unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, ACCESS_VIOLATION_SIGNAL) };
    if rc == 0 {
        return true;
    }
    let errno = unsafe { *libc::__errno_location() };
    errno != libc::ESRCH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_pipe_round_trips_a_byte() {
        let mut fds = [0 as RawFd; 2];
        unsafe {
            libc::pipe(fds.as_mut_ptr());
        }
        let byte: u8 = 1;
        unsafe {
            libc::write(fds[1], &byte as *const u8 as *const libc::c_void, 1);
        }
        let mut readback = [0u8; 1];
        unsafe {
            libc::read(fds[0], readback.as_mut_ptr() as *mut libc::c_void, 1);
        }
        assert_eq!(readback[0], 1);
    }
}
