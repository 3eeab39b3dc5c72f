//! The master-side software paging engine: address-space layout, the
//! residency map, replacement policies, the asynchronous operation slots,
//! multithread coordination, and the allocator split. [`Engine`] owns all of
//! it behind the single process-wide lock that core code runs under; the
//! interception layer (`dsm-master`) drives it from the fault path and the
//! transport (`dsm-transport`) supplies the handle type `H` that the async
//! slots carry.

pub mod alloc_split;
pub mod config;
pub mod error;
pub mod page_table;
pub mod policy;
pub mod protection;
pub mod region;
pub mod slots;
pub mod stats;
pub mod threads;

use std::sync::{Arc, Mutex};

use alloc_split::{ExternalHeap, InternalHeap};
use config::Config;
use error::{EngineResult, EnvironmentalError};
use page_table::PageTable;
use policy::{PolicyPayload, ReplacementPolicy};
use region::RegionLayout;
use slots::AsyncSlots;
use stats::Stats;
use threads::{GlobalLock, ThreadRegistry};

/// Everything the fault handler needs resident state for, assembled once at
/// startup and threaded through the rest of the process's lifetime.
pub struct Engine<H> {
    pub config: Config,
    pub region: RegionLayout,
    pub page_table: PageTable<PolicyPayload>,
    pub policy: Box<dyn ReplacementPolicy>,
    pub slots: AsyncSlots<H>,
    pub threads: ThreadRegistry,
    pub lock: GlobalLock,
    /// Taken once, at startup, by whatever installs the malloc-family
    /// interception shims; `None` afterward. Kept as a plain option rather
    /// than dropped from the struct so `Engine::new` is still the one place
    /// that proves the two heaps were constructed with disjoint bounds.
    external_heap: Option<ExternalHeap>,
    internal_heap: Option<InternalHeap>,
    /// Shared with the heartbeat task, which holds the same handle and only
    /// ever reads it: a locked snapshot read is much cheaper than the
    /// contention this would imply if the fault path itself blocked on it.
    pub stats: Arc<Mutex<Stats>>,
    local_pages: usize,
}

impl<H> Engine<H> {
    /// Assemble the engine from a validated config, the negotiated region
    /// layout, and the caller's choice of internal-heap placement (a range
    /// guaranteed disjoint from `region`, e.g. the process's own BSS/brk
    /// area on the host).
    pub fn new(
        config: Config,
        region: RegionLayout,
        local_pages: usize,
        internal_heap_base: usize,
        internal_heap_limit: usize,
    ) -> EngineResult<Self> {
        if local_pages == 0 {
            return Err(EnvironmentalError::CachePageAllocFailed { requested: 1 }.into());
        }
        let policy = policy::from_config(&config, local_pages);
        let page_size = region.page_size as usize;
        Ok(Engine {
            slots: AsyncSlots::new(page_size),
            page_table: PageTable::new(local_pages),
            policy,
            threads: ThreadRegistry::new(),
            lock: GlobalLock::new(),
            external_heap: Some(ExternalHeap::new(region.base, region.extent())),
            internal_heap: Some(InternalHeap::new(
                internal_heap_base,
                internal_heap_limit,
                region.base,
                region.extent(),
            )),
            stats: Arc::new(Mutex::new(Stats::default())),
            local_pages,
            region,
            config,
        })
    }

    pub fn local_pages(&self) -> usize {
        self.local_pages
    }

    /// A clone of the shared stats handle, for handing to a heartbeat task
    /// or any other observer that only ever reads counters.
    pub fn stats_handle(&self) -> Arc<Mutex<Stats>> {
        Arc::clone(&self.stats)
    }

    /// Hand the two heaps to whatever wires up the malloc-family
    /// interception shims. Panics if called more than once: only the
    /// startup sequence is expected to take them.
    pub fn take_heaps(&mut self) -> (ExternalHeap, InternalHeap) {
        (
            self.external_heap.take().expect("heaps already taken"),
            self.internal_heap.take().expect("heaps already taken"),
        )
    }

    /// True once every locally cached slot is occupied; the next fault must
    /// evict before it can admit.
    pub fn cache_is_full(&self) -> bool {
        self.page_table.len() >= self.local_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{Distribution, PolicyKind, PrefetchMode};

    fn test_config() -> Config {
        Config {
            page_size: None,
            base_addr: None,
            slave_mem: None,
            master_mem: None,
            local_pages: None,
            reserve_mem: None,
            reduce_mem: false,
            prefetch: PrefetchMode::None,
            async_evict: false,
            memcpy: true,
            nre_entries: 4,
            nre_retries: 5,
            nru_interval_ms: 5000,
            nru_rw: false,
            mlock: false,
            debug: 0,
            heartbeat_secs: 0,
            policy: PolicyKind::Fifo,
            distribution: Distribution::RoundRobin,
            heterogeneous: false,
            peer_base_port: 28900,
            max_outstanding_fetches: 2,
            max_outstanding_evicts: 2,
        }
    }

    fn test_region() -> RegionLayout {
        RegionLayout {
            base: 0x1_0000_0000,
            page_size: 4096,
            per_peer_bytes: 16 * 1024 * 1024,
            num_peers: 2,
            distribution: Distribution::RoundRobin,
        }
    }

    #[test]
    fn engine_assembles_with_disjoint_heaps() {
        let engine: Engine<u32> =
            Engine::new(test_config(), test_region(), 8, 0x9000_0000, 4096).unwrap();
        assert_eq!(engine.local_pages(), 8);
        assert!(!engine.cache_is_full());
    }

    #[test]
    fn zero_local_pages_is_an_environmental_failure_not_a_panic() {
        let result: EngineResult<Engine<u32>> =
            Engine::new(test_config(), test_region(), 0, 0x9000_0000, 4096);
        assert!(result.is_err());
    }

    #[test]
    fn cache_is_full_once_local_pages_are_admitted() {
        let mut engine: Engine<u32> =
            Engine::new(test_config(), test_region(), 2, 0x9000_0000, 4096).unwrap();
        engine.policy.admit(&mut engine.page_table, 1);
        assert!(!engine.cache_is_full());
        engine.policy.admit(&mut engine.page_table, 2);
        assert!(engine.cache_is_full());
    }
}
