//! The small set of externally visible symbols the core overrides to keep
//! its invariants from being violated by ordinary-looking user code: thread
//! creation, signal installation/masking, `/proc/meminfo`, bulk I/O, and
//! `ioctl`. Exported with `#[no_mangle]` so a `LD_PRELOAD` of this crate's
//! cdylib shadows the libc originals; each shim resolves and calls through
//! to the real symbol via `dlsym(RTLD_NEXT, ...)`.

use std::cell::RefCell;
use std::ffi::{c_void, CString};
use std::sync::OnceLock;

use crate::signal::ACCESS_VIOLATION_SIGNAL;

type PthreadCreateFn = unsafe extern "C" fn(
    *mut libc::pthread_t,
    *const libc::pthread_attr_t,
    extern "C" fn(*mut c_void) -> *mut c_void,
    *mut c_void,
) -> libc::c_int;

type SigactionFn =
    unsafe extern "C" fn(libc::c_int, *const libc::sigaction, *mut libc::sigaction) -> libc::c_int;

type PthreadSigmaskFn =
    unsafe extern "C" fn(libc::c_int, *const libc::sigset_t, *mut libc::sigset_t) -> libc::c_int;

type MmapFn = unsafe extern "C" fn(
    *mut c_void,
    libc::size_t,
    libc::c_int,
    libc::c_int,
    libc::c_int,
    libc::off_t,
) -> *mut c_void;

type OpenFn = unsafe extern "C" fn(*const libc::c_char, libc::c_int, libc::mode_t) -> libc::c_int;

type ReadFn = unsafe extern "C" fn(libc::c_int, *mut c_void, libc::size_t) -> libc::ssize_t;

type WriteFn = unsafe extern "C" fn(libc::c_int, *const c_void, libc::size_t) -> libc::ssize_t;

type IoctlFn = unsafe extern "C" fn(libc::c_int, libc::c_ulong, *mut c_void) -> libc::c_int;

/// The managed region's `[base, end)` extent, installed once at startup so
/// `mmap` can keep ordinary user mappings from ever landing inside it.
static REGION_BOUNDS: OnceLock<(usize, usize)> = OnceLock::new();

pub fn install_region_bounds(base: usize, end: usize) {
    let _ = REGION_BOUNDS.set((base, end));
}

fn overlaps_region(addr: usize, len: usize) -> bool {
    match REGION_BOUNDS.get() {
        Some(&(base, end)) => addr < end && addr + len > base,
        None => false,
    }
}

fn resolve_next<F: Copy>(name: &str) -> F {
    let cname = CString::new(name).unwrap();
    let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, cname.as_ptr()) };
    assert!(!sym.is_null(), "could not resolve real {name} via RTLD_NEXT");
    unsafe { std::mem::transmute_copy::<*mut c_void, F>(&sym) }
}

fn real_pthread_create() -> PthreadCreateFn {
    static CELL: OnceLock<usize> = OnceLock::new();
    let addr = *CELL.get_or_init(|| resolve_next::<PthreadCreateFn>("pthread_create") as usize);
    unsafe { std::mem::transmute::<usize, PthreadCreateFn>(addr) }
}

fn real_sigaction() -> SigactionFn {
    static CELL: OnceLock<usize> = OnceLock::new();
    let addr = *CELL.get_or_init(|| resolve_next::<SigactionFn>("sigaction") as usize);
    unsafe { std::mem::transmute::<usize, SigactionFn>(addr) }
}

fn real_pthread_sigmask() -> PthreadSigmaskFn {
    static CELL: OnceLock<usize> = OnceLock::new();
    let addr = *CELL.get_or_init(|| resolve_next::<PthreadSigmaskFn>("pthread_sigmask") as usize);
    unsafe { std::mem::transmute::<usize, PthreadSigmaskFn>(addr) }
}

fn real_mmap() -> MmapFn {
    static CELL: OnceLock<usize> = OnceLock::new();
    let addr = *CELL.get_or_init(|| resolve_next::<MmapFn>("mmap") as usize);
    unsafe { std::mem::transmute::<usize, MmapFn>(addr) }
}

fn real_open() -> OpenFn {
    static CELL: OnceLock<usize> = OnceLock::new();
    let addr = *CELL.get_or_init(|| resolve_next::<OpenFn>("open") as usize);
    unsafe { std::mem::transmute::<usize, OpenFn>(addr) }
}

fn real_read() -> ReadFn {
    static CELL: OnceLock<usize> = OnceLock::new();
    let addr = *CELL.get_or_init(|| resolve_next::<ReadFn>("read") as usize);
    unsafe { std::mem::transmute::<usize, ReadFn>(addr) }
}

fn real_write() -> WriteFn {
    static CELL: OnceLock<usize> = OnceLock::new();
    let addr = *CELL.get_or_init(|| resolve_next::<WriteFn>("write") as usize);
    unsafe { std::mem::transmute::<usize, WriteFn>(addr) }
}

fn real_ioctl() -> IoctlFn {
    static CELL: OnceLock<usize> = OnceLock::new();
    let addr = *CELL.get_or_init(|| resolve_next::<IoctlFn>("ioctl") as usize);
    unsafe { std::mem::transmute::<usize, IoctlFn>(addr) }
}

struct ThreadStartTrampolineArg {
    real_start: extern "C" fn(*mut c_void) -> *mut c_void,
    real_arg: *mut c_void,
}

extern "C" fn trampoline(arg: *mut c_void) -> *mut c_void {
    let boxed = unsafe { Box::from_raw(arg as *mut ThreadStartTrampolineArg) };
    unblock_access_violation_signal();
    (boxed.real_start)(boxed.real_arg)
}

fn unblock_access_violation_signal() {
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, ACCESS_VIOLATION_SIGNAL);
        (real_pthread_sigmask())(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
    }
}

/// Wraps every user thread's start function so the access-violation signal
/// is always unblocked at the top of the child, regardless of what mask the
/// parent thread was running under.
///
/// # Safety
/// Must only be called with the same argument contract as libc's
/// `pthread_create`: `start_routine` must be a valid function pointer and
/// `arg` must remain valid until `start_routine` returns.
#[no_mangle]
pub unsafe extern "C" fn pthread_create(
    thread: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    start_routine: extern "C" fn(*mut c_void) -> *mut c_void,
    arg: *mut c_void,
) -> libc::c_int {
    let boxed = Box::new(ThreadStartTrampolineArg {
        real_start: start_routine,
        real_arg: arg,
    });
    let wrapped_arg = Box::into_raw(boxed) as *mut c_void;
    (real_pthread_create())(thread, attr, trampoline, wrapped_arg)
}

/// Intercepts signal installation: an external (non-core) attempt to
/// install a handler for the access-violation signal is silently recorded
/// and dropped — the core's own handler stays installed. Any other signal
/// passes through unchanged.
///
/// # Safety
/// Same contract as libc's `sigaction`.
#[no_mangle]
pub unsafe extern "C" fn sigaction(
    signum: libc::c_int,
    act: *const libc::sigaction,
    oldact: *mut libc::sigaction,
) -> libc::c_int {
    if signum == ACCESS_VIOLATION_SIGNAL && !act.is_null() {
        tracing::debug!("dropped external attempt to install a handler for the access-violation signal");
        if !oldact.is_null() {
            (real_sigaction())(signum, std::ptr::null(), oldact);
        }
        return 0;
    }
    (real_sigaction())(signum, act, oldact)
}

/// Intercepts mask changes: strips the access-violation signal out of any
/// requested block set so the caller cannot accidentally block core fault
/// delivery.
///
/// # Safety
/// Same contract as libc's `pthread_sigmask`.
#[no_mangle]
pub unsafe extern "C" fn pthread_sigmask(
    how: libc::c_int,
    set: *const libc::sigset_t,
    oldset: *mut libc::sigset_t,
) -> libc::c_int {
    if how == libc::SIG_BLOCK && !set.is_null() {
        let mut scrubbed = *set;
        libc::sigdelset(&mut scrubbed, ACCESS_VIOLATION_SIGNAL);
        return (real_pthread_sigmask())(how, &scrubbed, oldset);
    }
    (real_pthread_sigmask())(how, set, oldset)
}

/// Intercepts `mmap`: a fixed-address request that would land inside the
/// managed region is refused outright (the caller asked for exactly that
/// address and core code cannot silently move it); a hint-only request that
/// the kernel happens to place inside the region is unmapped and retried
/// past the region's end, so user mappings never alias managed pages.
///
/// # Safety
/// Same contract as libc's `mmap`.
#[no_mangle]
pub unsafe extern "C" fn mmap(
    addr: *mut c_void,
    len: libc::size_t,
    prot: libc::c_int,
    flags: libc::c_int,
    fd: libc::c_int,
    offset: libc::off_t,
) -> *mut c_void {
    let result = (real_mmap())(addr, len, prot, flags, fd, offset);
    if result == libc::MAP_FAILED {
        return result;
    }
    if !overlaps_region(result as usize, len) {
        return result;
    }
    if flags & libc::MAP_FIXED != 0 {
        tracing::error!(addr = result as usize, "MAP_FIXED request overlaps the managed region");
        libc::munmap(result, len);
        *libc::__errno_location() = libc::ENOMEM;
        return libc::MAP_FAILED;
    }

    tracing::debug!(addr = result as usize, "kernel-chosen mapping overlapped the managed region, retrying past it");
    libc::munmap(result, len);
    let (_, region_end) = REGION_BOUNDS.get().copied().unwrap_or((0, 0));
    let hint = region_end as *mut c_void;
    (real_mmap())(hint, len, prot, flags, fd, offset)
}

/// Intercepts `open`: a read of `/proc/meminfo` is redirected to an
/// anonymous memory file holding the synthesized view (`MemTotal` reflecting
/// the managed region rather than host physical RAM), created fresh on
/// every open so repeated reads see the current extent.
///
/// # Safety
/// Same contract as libc's `open`.
#[no_mangle]
pub unsafe extern "C" fn open(path: *const libc::c_char, flags: libc::c_int, mode: libc::mode_t) -> libc::c_int {
    if path.is_null() {
        return (real_open())(path, flags, mode);
    }
    let cpath = std::ffi::CStr::from_ptr(path);
    if cpath.to_bytes() != b"/proc/meminfo" {
        return (real_open())(path, flags, mode);
    }
    let (_, region_end) = REGION_BOUNDS.get().copied().unwrap_or((0, 0));
    let extent = region_end as u64;
    let contents = synthesize_meminfo(extent);

    let name = CString::new("dsm-meminfo").unwrap();
    let memfd = libc::syscall(libc::SYS_memfd_create, name.as_ptr(), 0) as libc::c_int;
    if memfd < 0 {
        return (real_open())(path, flags, mode);
    }
    libc::write(memfd, contents.as_ptr() as *const c_void, contents.len());
    libc::lseek(memfd, 0, libc::SEEK_SET);
    memfd
}

thread_local! {
    static READ_CHUNKER: RefCell<AdaptiveChunkSizer> =
        RefCell::new(AdaptiveChunkSizer::new(os_page_size(), 4));
    static WRITE_CHUNKER: RefCell<AdaptiveChunkSizer> =
        RefCell::new(AdaptiveChunkSizer::new(os_page_size(), 4));
}

fn os_page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Pre-touch a whole buffer in the chunker's current stride, growing or
/// shrinking the stride as `pretouch` succeeds (it always does; the chunker
/// still tracks stride growth so a large bulk transfer doesn't re-touch at
/// one-OS-page granularity forever).
fn pretouch_chunked(chunker: &RefCell<AdaptiveChunkSizer>, buf: &mut [u8]) {
    let os_page = os_page_size();
    let mut off = 0;
    while off < buf.len() {
        let stride = chunker.borrow().current().max(os_page);
        let end = (off + stride).min(buf.len());
        pretouch(&mut buf[off..end], os_page);
        chunker.borrow_mut().record(true);
        off = end;
    }
}

/// Intercepts `read`: pre-touches the destination buffer, a chunk at a time
/// under an adaptively growing stride, before handing it to the real
/// syscall, so a read into a managed page faults (and is serviced) before
/// the kernel itself would otherwise be the one to take that fault.
///
/// # Safety
/// Same contract as libc's `read`.
#[no_mangle]
pub unsafe extern "C" fn read(fd: libc::c_int, buf: *mut c_void, count: libc::size_t) -> libc::ssize_t {
    let slice = std::slice::from_raw_parts_mut(buf as *mut u8, count);
    READ_CHUNKER.with(|c| pretouch_chunked(c, slice));
    (real_read())(fd, buf, count)
}

/// Intercepts `write`: pre-touches the source buffer for the same reason
/// `read` pre-touches its destination.
///
/// # Safety
/// Same contract as libc's `write`.
#[no_mangle]
pub unsafe extern "C" fn write(fd: libc::c_int, buf: *const c_void, count: libc::size_t) -> libc::ssize_t {
    let slice = std::slice::from_raw_parts_mut(buf as *mut u8, count);
    WRITE_CHUNKER.with(|c| pretouch_chunked(c, slice));
    (real_write())(fd, buf, count)
}

/// Intercepts `ioctl`: pre-touches the single pointer-sized argument most
/// `ioctl` requests pass, on the same grounds as the `read`/`write` shims.
/// Requests that pass a non-pointer third argument touch whatever garbage
/// address that integer happens to be, which is harmless: `pretouch` only
/// ever reads-then-writes the same byte back.
///
/// # Safety
/// Same contract as libc's three-argument `ioctl`.
#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: libc::c_int, request: libc::c_ulong, arg: *mut c_void) -> libc::c_int {
    if !arg.is_null() {
        let os_page_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let slice = std::slice::from_raw_parts_mut(arg as *mut u8, os_page_size);
        pretouch(slice, os_page_size);
    }
    (real_ioctl())(fd, request, arg)
}

/// Adaptive chunk sizing for bulk transfers: starts at the OS page size,
/// doubles after `max_consecutive` successes in a row, halves after
/// `max_consecutive` failures in a row, resets to the OS page size if a
/// previously-successful size now fails, and gives up once it would fall
/// below one OS page.
pub struct AdaptiveChunkSizer {
    os_page_size: usize,
    current: usize,
    consecutive_successes: u32,
    consecutive_failures: u32,
    max_consecutive: u32,
}

impl AdaptiveChunkSizer {
    pub fn new(os_page_size: usize, max_consecutive: u32) -> Self {
        AdaptiveChunkSizer {
            os_page_size,
            current: os_page_size,
            consecutive_successes: 0,
            consecutive_failures: 0,
            max_consecutive,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Record the outcome of attempting a transfer at the current chunk
    /// size. Returns `false` once the adaptive size has fallen below one OS
    /// page and the caller should give up.
    pub fn record(&mut self, succeeded: bool) -> bool {
        if succeeded {
            self.consecutive_failures = 0;
            self.consecutive_successes += 1;
            if self.consecutive_successes >= self.max_consecutive {
                self.consecutive_successes = 0;
                self.current = self.current.saturating_mul(2);
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;
            if self.current == self.os_page_size {
                return false;
            }
            if self.consecutive_failures >= self.max_consecutive {
                self.consecutive_failures = 0;
                self.current = (self.current / 2).max(self.os_page_size);
            } else {
                // a previously successful size just failed: reset, not halve.
                self.current = self.os_page_size;
            }
        }
        true
    }
}

/// Pre-touch every page a buffer spans before handing it to a syscall that
/// would otherwise fault while the core holds its internal locks (bulk I/O
/// and `ioctl` pointer arguments both need this).
pub fn pretouch(buf: &mut [u8], os_page_size: usize) {
    let mut off = 0;
    while off < buf.len() {
        buf[off] = buf[off];
        off += os_page_size.max(1);
    }
}

/// Synthesizes the `/proc/meminfo` view the core presents: `MemTotal`
/// reflects the managed region's extent rather than host physical RAM, so a
/// user program that parses it sees the aggregated address space.
pub fn synthesize_meminfo(extent_bytes: u64) -> String {
    let kib = extent_bytes / 1024;
    format!(
        "MemTotal:       {kib} kB\nMemFree:        {kib} kB\nMemAvailable:   {kib} kB\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_doubles_after_enough_successes() {
        let mut sizer = AdaptiveChunkSizer::new(4096, 3);
        assert_eq!(sizer.current(), 4096);
        sizer.record(true);
        sizer.record(true);
        sizer.record(true);
        assert_eq!(sizer.current(), 8192);
    }

    #[test]
    fn chunk_size_halves_after_enough_failures() {
        let mut sizer = AdaptiveChunkSizer::new(4096, 2);
        for _ in 0..2 {
            sizer.record(true);
        }
        assert_eq!(sizer.current(), 8192);
        sizer.record(false);
        sizer.record(false);
        assert_eq!(sizer.current(), 4096);
    }

    #[test]
    fn a_single_failure_after_success_resets_rather_than_halves() {
        let mut sizer = AdaptiveChunkSizer::new(4096, 5);
        for _ in 0..5 {
            sizer.record(true);
        }
        assert_eq!(sizer.current(), 8192);
        sizer.record(false);
        assert_eq!(sizer.current(), 4096);
    }

    #[test]
    fn gives_up_once_page_size_itself_fails() {
        let mut sizer = AdaptiveChunkSizer::new(4096, 1);
        assert!(!sizer.record(false));
    }

    #[test]
    fn meminfo_reports_the_region_extent_not_host_ram() {
        let text = synthesize_meminfo(2 * 1024 * 1024 * 1024);
        assert!(text.contains("MemTotal:       2097152 kB"));
    }
}
