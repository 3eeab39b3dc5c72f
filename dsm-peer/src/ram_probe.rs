//! Available-RAM probing: parse `/proc/meminfo`'s free/buffer/cached
//! fields, falling back to a `sysconf` query if the file is unreadable.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RamProbeError {
    #[error("could not read /proc/meminfo and the sysconf fallback also failed: {0}")]
    BothSourcesFailed(String),
}

fn parse_meminfo(contents: &str) -> HashMap<String, u64> {
    let mut fields = HashMap::new();
    for line in contents.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let kib: u64 = rest
            .trim()
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        fields.insert(key.to_string(), kib * 1024);
    }
    fields
}

/// Available bytes: `MemFree + Buffers + Cached`, matching the classic
/// "reclaimable without swapping" estimate kernels reported before
/// `MemAvailable` existed, for maximum portability across proc formats.
fn available_from_fields(fields: &HashMap<String, u64>) -> Option<u64> {
    let free = *fields.get("MemFree")?;
    let buffers = fields.get("Buffers").copied().unwrap_or(0);
    let cached = fields.get("Cached").copied().unwrap_or(0);
    Some(free + buffers + cached)
}

fn sysconf_fallback() -> u64 {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let avail_pages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };
    if page_size > 0 && avail_pages > 0 {
        page_size as u64 * avail_pages as u64
    } else {
        0
    }
}

/// Probe this peer's available RAM in bytes.
pub fn probe_available_bytes() -> Result<u64, RamProbeError> {
    match std::fs::read_to_string("/proc/meminfo") {
        Ok(contents) => {
            let fields = parse_meminfo(&contents);
            if let Some(bytes) = available_from_fields(&fields) {
                return Ok(bytes);
            }
            let fallback = sysconf_fallback();
            if fallback > 0 {
                Ok(fallback)
            } else {
                Err(RamProbeError::BothSourcesFailed(
                    "/proc/meminfo missing MemFree and sysconf returned 0".into(),
                ))
            }
        }
        Err(e) => {
            let fallback = sysconf_fallback();
            if fallback > 0 {
                Ok(fallback)
            } else {
                Err(RamProbeError::BothSourcesFailed(e.to_string()))
            }
        }
    }
}

/// Apply a configured reserve, skimming off either a fixed byte count or a
/// percentage before the buffer budget is settled.
pub fn apply_reserve(available: u64, reserve: Option<ReserveSpec>) -> u64 {
    match reserve {
        None => available,
        Some(ReserveSpec::Bytes(b)) => available.saturating_sub(b),
        Some(ReserveSpec::Percent(p)) => available - (available * p as u64 / 100),
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ReserveSpec {
    Bytes(u64),
    Percent(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_free_buffers_cached() {
        let sample = "MemTotal:       16384000 kB\nMemFree:         1024000 kB\nBuffers:          204800 kB\nCached:          2048000 kB\n";
        let fields = parse_meminfo(sample);
        assert_eq!(
            available_from_fields(&fields),
            Some((1024000 + 204800 + 2048000) * 1024)
        );
    }

    #[test]
    fn reserve_percent_skims_the_right_fraction() {
        assert_eq!(apply_reserve(1000, Some(ReserveSpec::Percent(10))), 900);
        assert_eq!(apply_reserve(1000, Some(ReserveSpec::Bytes(400))), 600);
        assert_eq!(apply_reserve(1000, None), 1000);
    }

    #[test]
    fn missing_memfree_falls_back_to_sysconf() {
        let fields = parse_meminfo("MemTotal: 1000 kB\n");
        assert_eq!(available_from_fields(&fields), None);
    }
}
