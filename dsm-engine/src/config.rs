//! Environment-driven configuration, read once at startup into an immutable
//! [`Config`] value that is threaded through the engine rather than re-read
//! from the environment ad hoc.

use crate::error::{EngineError, EnvironmentalError};
use std::env;

/// Which speculative-fetch strategy the fault handler should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchMode {
    None,
    Next,
    Delta,
}

/// Which replacement policy governs eviction and admission protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Fifo,
    Random,
    Nre,
    Nru,
}

/// How a logical page's holder and offset are computed from its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    RoundRobin,
    Block,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub page_size: Option<u64>,
    pub base_addr: Option<BaseAddrOverride>,
    pub slave_mem: Option<u64>,
    pub master_mem: Option<u64>,
    pub local_pages: Option<LocalPagesOverride>,
    pub reserve_mem: Option<ByteOrPercent>,
    pub reduce_mem: bool,
    pub prefetch: PrefetchMode,
    pub async_evict: bool,
    pub memcpy: bool,
    pub nre_entries: u32,
    pub nre_retries: u32,
    pub nru_interval_ms: u64,
    pub nru_rw: bool,
    pub mlock: bool,
    pub debug: u8,
    pub heartbeat_secs: u64,
    pub policy: PolicyKind,
    pub distribution: Distribution,
    pub heterogeneous: bool,
    pub peer_base_port: u16,
    pub max_outstanding_fetches: u32,
    pub max_outstanding_evicts: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum BaseAddrOverride {
    Absolute(usize),
    Relative(isize),
}

#[derive(Debug, Clone, Copy)]
pub enum LocalPagesOverride {
    Count(usize),
    PercentOfMax(u8),
}

#[derive(Debug, Clone, Copy)]
pub enum ByteOrPercent {
    Bytes(u64),
    Percent(u8),
}

impl Config {
    /// Parse configuration from the process environment. Absent keys take
    /// their documented default; a value present for a recognized key that
    /// fails to parse is an [`EnvironmentalError::InvalidConfig`].
    pub fn from_env() -> Result<Self, EngineError> {
        Ok(Config {
            page_size: env_page_size("PAGESIZE")?,
            base_addr: env_base_addr("BASEADDR")?,
            slave_mem: env_bytes_opt("SLAVEMEM")?,
            master_mem: env_bytes_opt("MASTERMEM")?,
            local_pages: env_local_pages("LOCAL_PAGES")?,
            reserve_mem: env_byte_or_percent("RESERVEMEM")?,
            reduce_mem: env_bool("REDUCEMEM", false)?,
            prefetch: env_prefetch("PREFETCH")?,
            async_evict: env_bool("ASYNCEVICT", false)?,
            memcpy: env_bool("MEMCPY", true)?,
            nre_entries: env_u32("NRE_ENTRIES", 4)?,
            nre_retries: env_u32("NRE_RETRIES", 5)?,
            nru_interval_ms: env_u64("NRU_INTERVAL", 5000)?,
            nru_rw: env_bool("NRU_RW", false)?,
            mlock: env_bool("MLOCK", false)?,
            debug: env_u8("DEBUG", 0)?,
            heartbeat_secs: env_u64("HEARTBEAT", 0)?,
            policy: env_policy("POLICY")?,
            distribution: env_distribution("DISTRIBUTION")?,
            heterogeneous: env_bool("HETEROGENEOUS", false)?,
            peer_base_port: env_u32("PEER_BASE_PORT", 28900)? as u16,
            max_outstanding_fetches: env_u32("MAX_FETCHES", 2)?,
            max_outstanding_evicts: env_u32("MAX_EVICTS", 2)?,
        })
    }
}

fn invalid(key: &'static str, value: String, reason: impl Into<String>) -> EngineError {
    EnvironmentalError::InvalidConfig {
        key,
        value,
        reason: reason.into(),
    }
    .into()
}

fn raw(key: &'static str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &'static str, default: bool) -> Result<bool, EngineError> {
    match raw(key) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "TRUE" | "yes" | "on" => Ok(true),
            "0" | "false" | "FALSE" | "no" | "off" => Ok(false),
            _ => Err(invalid(key, v, "expected a boolean-ish value")),
        },
    }
}

fn env_u32(key: &'static str, default: u32) -> Result<u32, EngineError> {
    match raw(key) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| invalid(key, v, "expected an integer")),
    }
}

fn env_u64(key: &'static str, default: u64) -> Result<u64, EngineError> {
    match raw(key) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| invalid(key, v, "expected an integer")),
    }
}

fn env_u8(key: &'static str, default: u8) -> Result<u8, EngineError> {
    match raw(key) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| invalid(key, v, "expected an integer 0-255")),
    }
}

/// Parses a byte count with an optional `K`/`M`/`G` (binary, ×1024) suffix.
fn parse_bytes(v: &str) -> Option<u64> {
    let v = v.trim();
    let (num, mult): (&str, u64) = if let Some(n) = v.strip_suffix(['k', 'K']) {
        (n, 1024)
    } else if let Some(n) = v.strip_suffix(['m', 'M']) {
        (n, 1024 * 1024)
    } else if let Some(n) = v.strip_suffix(['g', 'G']) {
        (n, 1024 * 1024 * 1024)
    } else {
        (v, 1)
    };
    num.trim().parse::<u64>().ok().map(|n| n * mult)
}

fn env_bytes_opt(key: &'static str) -> Result<Option<u64>, EngineError> {
    match raw(key) {
        None => Ok(None),
        Some(v) => parse_bytes(&v)
            .map(Some)
            .ok_or_else(|| invalid(key, v, "expected a byte count, optionally suffixed K/M/G")),
    }
}

fn env_page_size(key: &'static str) -> Result<Option<u64>, EngineError> {
    match raw(key) {
        None => Ok(None),
        Some(v) if v == "auto" => Ok(None),
        Some(v) => parse_bytes(&v)
            .map(Some)
            .ok_or_else(|| invalid(key, v, "expected 'auto' or a byte count")),
    }
}

fn env_base_addr(key: &'static str) -> Result<Option<BaseAddrOverride>, EngineError> {
    match raw(key) {
        None => Ok(None),
        Some(v) => {
            if let Some(rest) = v.strip_prefix('+') {
                let delta: isize = rest
                    .parse()
                    .map_err(|_| invalid(key, v.clone(), "expected a signed relative offset"))?;
                Ok(Some(BaseAddrOverride::Relative(delta)))
            } else if let Some(rest) = v.strip_prefix('-') {
                let delta: isize = rest
                    .parse()
                    .map_err(|_| invalid(key, v.clone(), "expected a signed relative offset"))?;
                Ok(Some(BaseAddrOverride::Relative(-delta)))
            } else {
                let stripped = v.strip_prefix("0x").unwrap_or(&v);
                let abs = usize::from_str_radix(stripped, 16)
                    .or_else(|_| v.parse::<usize>())
                    .map_err(|_| invalid(key, v.clone(), "expected a hex or decimal address"))?;
                Ok(Some(BaseAddrOverride::Absolute(abs)))
            }
        }
    }
}

fn env_local_pages(key: &'static str) -> Result<Option<LocalPagesOverride>, EngineError> {
    match raw(key) {
        None => Ok(None),
        Some(v) => {
            if let Some(pct) = v.strip_suffix('%') {
                let pct: u8 = pct
                    .parse()
                    .map_err(|_| invalid(key, v.clone(), "expected a percentage like '50%'"))?;
                Ok(Some(LocalPagesOverride::PercentOfMax(pct)))
            } else {
                let n: usize = v
                    .parse()
                    .map_err(|_| invalid(key, v.clone(), "expected a page count or percentage"))?;
                Ok(Some(LocalPagesOverride::Count(n)))
            }
        }
    }
}

fn env_byte_or_percent(key: &'static str) -> Result<Option<ByteOrPercent>, EngineError> {
    match raw(key) {
        None => Ok(None),
        Some(v) => {
            if let Some(pct) = v.strip_suffix('%') {
                let pct: u8 = pct
                    .parse()
                    .map_err(|_| invalid(key, v.clone(), "expected a percentage like '10%'"))?;
                Ok(Some(ByteOrPercent::Percent(pct)))
            } else {
                parse_bytes(&v)
                    .map(ByteOrPercent::Bytes)
                    .map(Some)
                    .ok_or_else(|| invalid(key, v, "expected a byte count or percentage"))
            }
        }
    }
}

fn env_prefetch(key: &'static str) -> Result<PrefetchMode, EngineError> {
    match raw(key).as_deref() {
        None => Ok(PrefetchMode::None),
        Some("none") => Ok(PrefetchMode::None),
        Some("next") => Ok(PrefetchMode::Next),
        Some("delta") => Ok(PrefetchMode::Delta),
        Some(other) => Err(invalid(key, other.to_string(), "expected none/next/delta")),
    }
}

fn env_policy(key: &'static str) -> Result<PolicyKind, EngineError> {
    match raw(key).as_deref() {
        None => Ok(PolicyKind::Fifo),
        Some("fifo") => Ok(PolicyKind::Fifo),
        Some("random") => Ok(PolicyKind::Random),
        Some("nre") => Ok(PolicyKind::Nre),
        Some("nru") => Ok(PolicyKind::Nru),
        Some(other) => Err(invalid(key, other.to_string(), "expected fifo/random/nre/nru")),
    }
}

fn env_distribution(key: &'static str) -> Result<Distribution, EngineError> {
    match raw(key).as_deref() {
        None => Ok(Distribution::RoundRobin),
        Some("roundrobin") | Some("round_robin") => Ok(Distribution::RoundRobin),
        Some("block") => Ok(Distribution::Block),
        Some(other) => Err(invalid(key, other.to_string(), "expected roundrobin/block")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_byte_suffixes() {
        assert_eq!(parse_bytes("512"), Some(512));
        assert_eq!(parse_bytes("4K"), Some(4 * 1024));
        assert_eq!(parse_bytes("1M"), Some(1024 * 1024));
        assert_eq!(parse_bytes("2G"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_bytes("nope"), None);
    }

    #[test]
    fn defaults_when_absent() {
        // SAFETY in the test-only sense: not touching a key any other test uses.
        env::remove_var("DSM_TEST_UNSET_KEY_XYZ");
        assert_eq!(env_bool("DSM_TEST_UNSET_KEY_XYZ", true).unwrap(), true);
        assert_eq!(env_u64("DSM_TEST_UNSET_KEY_XYZ", 42).unwrap(), 42);
    }
}
