//! The peer's local buffer: the bytes it actually holds on behalf of the
//! managed region. Sizing goes probe → reserve → optional empirical
//! reduction → optional `mlock`.

use tracing::{info, warn};

/// Empirically touch `len` bytes of a freshly allocated buffer, shrinking
/// page-by-page from the end until no major faults are observed. A major
/// fault here means the kernel had to go to backing store (swap) for a
/// page the peer expected to hold resident in RAM.
///
/// Returns the size that touched clean.
pub fn reduce_until_fault_free(mut len: usize, page_size: usize) -> usize {
    loop {
        if len < page_size {
            return 0;
        }
        let mut buf = vec![0u8; len];
        let before = major_fault_count();
        let mut off = 0;
        while off < len {
            buf[off] = 1;
            off += page_size;
        }
        let after = major_fault_count();
        drop(buf);
        if after <= before {
            return len;
        }
        warn!(len, "observed major faults touching the full buffer, shrinking");
        len -= page_size;
    }
}

fn major_fault_count() -> u64 {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return 0;
    }
    usage.ru_majflt as u64
}

/// Request the OS lock this peer's buffer into RAM so it cannot be
/// swapped out from under the master's assumption of stable residency.
/// Failure is logged, not fatal: `MLOCK` is a best-effort hint.
pub fn try_mlock(addr: *const u8, len: usize) {
    let rc = unsafe { libc::mlock(addr as *const libc::c_void, len) };
    if rc != 0 {
        let errno = unsafe { *libc::__errno_location() };
        warn!(errno, "mlock request failed, continuing without it");
    } else {
        info!(len, "buffer locked into RAM");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_returns_zero_once_below_one_page() {
        assert_eq!(reduce_until_fault_free(0, 4096), 0);
    }
}
