//! Reservation of the managed virtual range: one anonymous, private,
//! initially no-access mapping, with a leading prefix backed immediately so
//! `local_pages` worth of cold pages never grow the kernel's mapping count
//! at runtime.

use dsm_engine::config::BaseAddrOverride;
use dsm_engine::protection::Protection;
use tracing::{info, warn};

use crate::error::MasterError;

fn to_mmap_prot(prot: Protection) -> i32 {
    match prot {
        Protection::NoAccess => libc::PROT_NONE,
        Protection::ReadOnly => libc::PROT_READ,
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    }
}

/// The end of the data segment, rounded up to `page_size`, used as the
/// preferred placement for the managed region when no override is given.
fn end_of_data_segment(page_size: usize) -> usize {
    // `sbrk(0)` reports the current break without moving it; this is the
    // traditional "just past everything we've statically linked" anchor.
    let brk = unsafe { libc::sbrk(0) };
    if brk == usize::MAX as *mut libc::c_void {
        0x1000_0000
    } else {
        let addr = brk as usize;
        addr.div_ceil(page_size) * page_size
    }
}

/// Reserve `extent` bytes of address space, honoring `override_addr` if
/// given. Falls back to an OS-chosen address if a fixed placement fails and
/// the override did not demand a fixed mapping.
pub fn reserve_region(
    extent: u64,
    page_size: u64,
    override_addr: Option<BaseAddrOverride>,
) -> Result<usize, MasterError> {
    let preferred = match override_addr {
        Some(BaseAddrOverride::Absolute(addr)) => addr,
        Some(BaseAddrOverride::Relative(delta)) => {
            let base = end_of_data_segment(page_size as usize) as isize;
            (base + delta) as usize
        }
        None => end_of_data_segment(page_size as usize),
    };

    let mapped = unsafe {
        libc::mmap(
            preferred as *mut libc::c_void,
            extent as usize,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };

    if mapped == libc::MAP_FAILED {
        let errno = unsafe { *libc::__errno_location() };
        warn!(preferred, errno, "preferred placement failed, retrying at an arbitrary address");
        let mapped = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                extent as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            let errno = unsafe { *libc::__errno_location() };
            return Err(MasterError::MmapFailed {
                size: extent as usize,
                errno,
            });
        }
        info!(addr = mapped as usize, extent, "reserved managed region at arbitrary address");
        return Ok(mapped as usize);
    }

    info!(addr = preferred, extent, "reserved managed region at preferred address");
    Ok(preferred)
}

/// Back the first `local_pages * page_size` bytes as resident read-write
/// "pre-allocated cold" pages, so the page table's initial admissions don't
/// cost a fresh kernel mapping each.
pub fn prefault_cold_prefix(base: usize, local_pages: u64, page_size: u64) -> Result<(), MasterError> {
    let len = (local_pages * page_size) as usize;
    set_protection(base, len, Protection::ReadWrite)?;
    // touch every OS page once so the kernel actually backs it now.
    let os_page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    let mut off = 0;
    while off < len {
        unsafe {
            std::ptr::write_volatile((base + off) as *mut u8, 0);
        }
        off += os_page.max(1);
    }
    Ok(())
}

pub fn set_protection(addr: usize, len: usize, prot: Protection) -> Result<(), MasterError> {
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, len, to_mmap_prot(prot)) };
    if rc != 0 {
        let errno = unsafe { *libc::__errno_location() };
        return Err(MasterError::MprotectFailed { addr, len, prot, errno });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_reprotect_a_small_region() {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        let extent = page_size * 4;
        let base = reserve_region(extent, page_size, None).expect("reservation should succeed");
        set_protection(base, extent as usize, Protection::ReadWrite).unwrap();
        unsafe {
            std::ptr::write_volatile(base as *mut u8, 7);
            assert_eq!(std::ptr::read_volatile(base as *const u8), 7);
        }
        set_protection(base, extent as usize, Protection::NoAccess).unwrap();
        unsafe {
            libc::munmap(base as *mut libc::c_void, extent as usize);
        }
    }
}
