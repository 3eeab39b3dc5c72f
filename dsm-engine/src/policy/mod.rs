//! Replacement policies. All four share one contract: given a faulting page
//! `F`, decide `(new_protections, victim_or_none, victim_is_clean)` and
//! mutate the shared page table so that `F` is resident and the victim (if
//! any) is not.

mod fifo;
mod nre;
mod nru;
mod random;

pub use fifo::FifoPolicy;
pub use nre::NrePolicy;
pub use nru::NruPolicy;
pub use random::RandomPolicy;

use crate::config::{Config, PolicyKind};
use crate::page_table::PageTable;
use crate::protection::Protection;

/// Per-page state a policy may need beyond plain residency. `None` for
/// policies that track nothing (FIFO, Random, NRE); `Nru` for the
/// reference/modified bits.
#[derive(Debug, Clone, Copy)]
pub enum PolicyPayload {
    None,
    Nru { referenced: bool, modified: bool },
}

impl PolicyPayload {
    pub fn as_nru(&self) -> Option<(bool, bool)> {
        match self {
            PolicyPayload::Nru { referenced, modified } => Some((*referenced, *modified)),
            PolicyPayload::None => None,
        }
    }
}

pub struct AdmitDecision {
    pub new_page_protection: Protection,
    pub victim: Option<u32>,
    pub victim_clean: bool,
}

/// A page-replacement policy operating against the engine's shared page
/// table (so `|resident| ≤ local_pages` and `at_rank` coverage hold
/// regardless of which policy is active).
pub trait ReplacementPolicy: Send {
    /// Admit a newly faulted page that is not yet resident. Performs the
    /// table mutation itself (deletes the victim if any, inserts `F`).
    fn admit(
        &mut self,
        table: &mut PageTable<PolicyPayload>,
        faulting_page: u32,
    ) -> AdmitDecision;

    /// A write landed on an already-resident page mapped read-only (the
    /// NRU write-upgrade case). Returns the protection to install. No-op
    /// for policies that never admit pages read-only.
    fn on_write_upgrade(&mut self, table: &mut PageTable<PolicyPayload>, page: u32) -> Protection {
        let _ = (table, page);
        Protection::ReadWrite
    }

    /// Lazy periodic maintenance (the NRU reference-bit sweep). No-op for
    /// policies without a time-driven component.
    fn sweep_if_due(&mut self, table: &mut PageTable<PolicyPayload>, now_ms: u64) {
        let _ = (table, now_ms);
    }

    /// Whether this policy ever admits a page read-only, i.e. whether
    /// prefetching (which relies on residency being observable through
    /// protection faults) is meaningful for it.
    fn supports_prefetch(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str;
}

/// Build the configured policy with the given page-table capacity.
pub fn from_config(config: &Config, capacity: usize) -> Box<dyn ReplacementPolicy> {
    match config.policy {
        PolicyKind::Fifo => Box::new(FifoPolicy::new(capacity)),
        PolicyKind::Random => Box::new(RandomPolicy::new(capacity)),
        PolicyKind::Nre => Box::new(NrePolicy::new(
            capacity,
            config.nre_entries as usize,
            config.nre_retries,
        )),
        PolicyKind::Nru => Box::new(NruPolicy::new(capacity, config.nru_rw, config.nru_interval_ms)),
    }
}
