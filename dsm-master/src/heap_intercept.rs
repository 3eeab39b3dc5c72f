//! Routes the libc malloc family through the engine's split heaps instead of
//! the system allocator. Which heap a call lands on depends on whose code is
//! asking: [`enter_core`]/[`exit_core`] bracket every section where core
//! code itself (holding the global lock, servicing a fault) runs, so the
//! engine's own allocations never contend with the user heap's region
//! bookkeeping, and the user program's allocations never land in the
//! engine's disjoint internal range.
//!
//! Before either heap is installed — during process startup, before
//! [`install`] runs — every call falls back to the real libc allocator
//! resolved the same way the other shims resolve their real symbols.

use std::cell::Cell;
use std::ffi::{c_void, CString};
use std::sync::{Mutex, OnceLock};

use dsm_engine::alloc_split::{ExternalHeap, InternalHeap};

type MallocFn = unsafe extern "C" fn(libc::size_t) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);

fn real_malloc() -> MallocFn {
    static CELL: OnceLock<usize> = OnceLock::new();
    let addr = *CELL.get_or_init(|| {
        let name = CString::new("malloc").unwrap();
        let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
        assert!(!sym.is_null(), "could not resolve real malloc via RTLD_NEXT");
        sym as usize
    });
    unsafe { std::mem::transmute::<usize, MallocFn>(addr) }
}

fn real_free() -> FreeFn {
    static CELL: OnceLock<usize> = OnceLock::new();
    let addr = *CELL.get_or_init(|| {
        let name = CString::new("free").unwrap();
        let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
        assert!(!sym.is_null(), "could not resolve real free via RTLD_NEXT");
        sym as usize
    });
    unsafe { std::mem::transmute::<usize, FreeFn>(addr) }
}

struct Heaps {
    external: ExternalHeap,
    internal: InternalHeap,
}

static HEAPS: Mutex<Option<Heaps>> = Mutex::new(None);

thread_local! {
    /// Set for the duration of any section where core code itself runs
    /// under the global lock, so its own allocations route to the internal
    /// heap rather than the user-facing external one.
    static IN_CORE: Cell<bool> = Cell::new(false);
}

/// Install the two heaps once the region and internal-heap bounds are
/// known. Must run before the user entry point gets control.
pub fn install(external: ExternalHeap, internal: InternalHeap) {
    *HEAPS.lock().unwrap() = Some(Heaps { external, internal });
}

/// Mark the calling thread as running core code. Must be paired with
/// [`exit_core`]; nesting is not supported since only the fault-service
/// thread ever calls this.
pub fn enter_core() {
    IN_CORE.with(|c| c.set(true));
}

pub fn exit_core() {
    IN_CORE.with(|c| c.set(false));
}

fn in_core() -> bool {
    IN_CORE.with(|c| c.get())
}

/// Tag recorded just before the pointer handed back to the caller, so
/// `free`/`realloc` know which heap (or the libc fallback) to return the
/// block to without having to re-derive it from the address.
#[repr(C)]
struct BlockHeader {
    size: usize,
    tag: u8,
}

const TAG_EXTERNAL: u8 = 0;
const TAG_INTERNAL: u8 = 1;
const TAG_LIBC: u8 = 2;

const HEADER_SIZE: usize = std::mem::size_of::<BlockHeader>();

unsafe fn header_for(user_ptr: *mut c_void) -> *mut BlockHeader {
    (user_ptr as *mut u8).sub(HEADER_SIZE) as *mut BlockHeader
}

unsafe fn alloc_with_header(size: libc::size_t) -> *mut c_void {
    let total = size + HEADER_SIZE;

    let mut heaps = HEAPS.lock().unwrap();
    let Some(h) = heaps.as_mut() else {
        drop(heaps);
        let raw = (real_malloc())(total as libc::size_t);
        if raw.is_null() {
            return std::ptr::null_mut();
        }
        let header = raw as *mut BlockHeader;
        (*header).size = size;
        (*header).tag = TAG_LIBC;
        return (raw as *mut u8).add(HEADER_SIZE) as *mut c_void;
    };

    if in_core() {
        match h.internal.alloc(total) {
            Ok(Some(addr)) => {
                let header = addr as *mut BlockHeader;
                (*header).size = size;
                (*header).tag = TAG_INTERNAL;
                (addr as *mut u8).add(HEADER_SIZE) as *mut c_void
            }
            Ok(None) => std::ptr::null_mut(),
            Err(e) => {
                tracing::error!(error = %e, "internal heap invariant violated");
                std::process::abort();
            }
        }
    } else {
        match h.external.grow(total) {
            Some(addr) => {
                let header = addr as *mut BlockHeader;
                (*header).size = size;
                (*header).tag = TAG_EXTERNAL;
                (addr as *mut u8).add(HEADER_SIZE) as *mut c_void
            }
            None => std::ptr::null_mut(),
        }
    }
}

/// # Safety
/// Same contract as libc's `malloc`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: libc::size_t) -> *mut c_void {
    alloc_with_header(size)
}

/// # Safety
/// Same contract as libc's `calloc`.
#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: libc::size_t, size: libc::size_t) -> *mut c_void {
    let Some(total) = nmemb.checked_mul(size) else {
        return std::ptr::null_mut();
    };
    let ptr = alloc_with_header(total);
    if !ptr.is_null() {
        std::ptr::write_bytes(ptr as *mut u8, 0, total);
    }
    ptr
}

/// # Safety
/// Same contract as libc's `free`.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    let header = header_for(ptr);
    let size = (*header).size;
    let tag = (*header).tag;
    let header_addr = header as usize;
    match tag {
        TAG_EXTERNAL => {
            if let Some(h) = HEAPS.lock().unwrap().as_mut() {
                h.external.free(header_addr, size + HEADER_SIZE);
            }
        }
        TAG_INTERNAL => {
            if let Some(h) = HEAPS.lock().unwrap().as_mut() {
                h.internal.free(header_addr, size + HEADER_SIZE);
            }
        }
        _ => (real_free())(header as *mut c_void),
    }
}

/// # Safety
/// Same contract as libc's `realloc`. Always copies into a fresh block: the
/// allocator core has no in-place grow primitive.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: libc::size_t) -> *mut c_void {
    if ptr.is_null() {
        return alloc_with_header(size);
    }
    let header = header_for(ptr);
    let old_size = (*header).size;
    let new_ptr = alloc_with_header(size);
    if new_ptr.is_null() {
        return std::ptr::null_mut();
    }
    let copy_len = old_size.min(size);
    std::ptr::copy_nonoverlapping(ptr as *const u8, new_ptr as *mut u8, copy_len);
    free(ptr);
    new_ptr
}

/// # Safety
/// Same contract as libc's `valloc`: the returned pointer is OS-page
/// aligned. Over-allocates enough slack to place an aligned pointer with
/// its header still immediately in front of it.
#[no_mangle]
pub unsafe extern "C" fn valloc(size: libc::size_t) -> *mut c_void {
    let os_page = libc::sysconf(libc::_SC_PAGESIZE) as usize;
    // Slack for both the alignment shift and the second header placed at the
    // aligned offset: without the extra `HEADER_SIZE` the shifted header can
    // land past the end of the block the inner allocation actually reserved.
    let raw = alloc_with_header(size + os_page + HEADER_SIZE);
    if raw.is_null() {
        return std::ptr::null_mut();
    }
    let raw_addr = raw as usize;
    let aligned = (raw_addr + HEADER_SIZE + os_page - 1) & !(os_page - 1);
    let header = (aligned - HEADER_SIZE) as *mut BlockHeader;
    let source_header = header_for(raw);
    (*header).size = (*source_header).size;
    (*header).tag = (*source_header).tag;
    aligned as *mut c_void
}
