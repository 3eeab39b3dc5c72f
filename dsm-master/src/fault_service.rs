//! The deferred half of fault handling: everything the signal handler
//! itself is too constrained to do. Runs on one dedicated OS thread that
//! wakes on the self-pipe, acquires the global lock, freezes peer threads,
//! runs the replacement policy, drives the transport, and fixes up
//! protections before releasing the lock and letting the faulting
//! instruction re-execute.

use std::time::{Duration, Instant};

use dsm_engine::config::PrefetchMode;
use dsm_engine::protection::Protection;
use dsm_engine::region::Holder;
use dsm_engine::threads::ThreadId;
use dsm_engine::Engine;
use dsm_transport::Transport;
use tracing::{info_span, trace, warn};

use crate::error::MasterError;
use crate::region_alloc::set_protection;
use crate::signal::{self, WakePipe};

pub struct FaultService<T: Transport> {
    pub engine: Engine<T::Handle>,
    pub transport: T,
    pub runtime: tokio::runtime::Handle,
    pub wake: WakePipe,
    pub freeze_timeout: Duration,
    /// Monotonic origin for the NRU reference-bit sweep's lazy clock.
    pub start: Instant,
    /// The address currently mid-service on this thread, if any. A second
    /// fault for a different address arriving while this is set means core
    /// code itself faulted — always a fatal invariant, never a condition to
    /// recover from.
    servicing: Option<usize>,
    /// The last two distinct pages faulted on, oldest first: `DELTA`
    /// prefetch needs both to extrapolate the next candidate.
    fault_history: (Option<u32>, Option<u32>),
}

impl<T: Transport> FaultService<T> {
    pub fn new(
        engine: Engine<T::Handle>,
        transport: T,
        runtime: tokio::runtime::Handle,
        wake: WakePipe,
        freeze_timeout: Duration,
    ) -> Self {
        FaultService {
            engine,
            transport,
            runtime,
            wake,
            freeze_timeout,
            start: Instant::now(),
            servicing: None,
            fault_history: (None, None),
        }
    }
}

fn current_tid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Reads the state character (field 3) of `/proc/self/task/<tid>/stat`.
/// `None` if the thread is already gone.
fn thread_state_char(tid: libc::pid_t) -> Option<char> {
    let path = format!("/proc/self/task/{tid}/stat");
    let contents = std::fs::read_to_string(path).ok()?;
    let after_comm = contents.rsplit_once(')')?.1;
    after_comm.trim_start().chars().next()
}

impl<T: Transport> FaultService<T> {
    /// Block until the next access violation, then fully service it.
    pub fn run_one_fault(&mut self) -> Result<(), MasterError> {
        let addr = signal::wait_for_fault(&self.wake);
        let tid = ThreadId(current_tid() as u64);
        self.engine.lock.acquire(tid);
        crate::heap_intercept::enter_core();
        let result = self.service(addr, tid);
        crate::heap_intercept::exit_core();
        self.engine.lock.release(tid);
        result
    }

    fn service(&mut self, addr: usize, faulting: ThreadId) -> Result<(), MasterError> {
        if !self.engine.region.contains(addr) {
            // Not ours: a bug in the user program, not something core code
            // owns. Hand the fault back to whatever would have handled it
            // had this process never installed its own handler.
            warn!(addr, "fault outside the managed region, reraising to the previous disposition");
            signal::restore_previous_and_reraise(faulting.0 as libc::pid_t);
            return Ok(());
        }

        let page_addr = self.engine.region.page_floor(addr);
        let page = self.engine.region.page_index_of(page_addr);

        if let Some(current) = self.servicing {
            if current != page_addr {
                let invariant = dsm_engine::error::InvariantError::ReentrantFault {
                    current,
                    new: page_addr,
                };
                return Err(dsm_engine::error::EngineError::from(invariant).into());
            }
        }
        self.servicing = Some(page_addr);
        let result = self.service_resident_or_admit(page, page_addr, faulting);
        self.servicing = None;
        result
    }

    fn service_resident_or_admit(
        &mut self,
        page: u32,
        page_addr: usize,
        faulting: ThreadId,
    ) -> Result<(), MasterError> {
        let span = info_span!("fault", page);
        let _entered = span.enter();

        self.complete_pending_evict()?;

        let now_ms = self.start.elapsed().as_millis() as u64;
        self.engine.policy.sweep_if_due(&mut self.engine.page_table, now_ms);

        self.freeze_peer_threads(faulting);

        if self.engine.page_table.contains(page) {
            let prot = self.engine.policy.on_write_upgrade(&mut self.engine.page_table, page);
            set_protection(page_addr, self.engine.region.page_size as usize, prot)?;
            self.engine.stats.lock().unwrap().record_fault();
            self.record_access(page);
            self.maybe_begin_prefetch(page)?;
            return Ok(());
        }

        if self.resolve_prefetch(page, page_addr)? {
            self.engine.stats.lock().unwrap().record_fault();
            self.record_access(page);
            self.maybe_begin_prefetch(page)?;
            return Ok(());
        }

        let decision = self.engine.policy.admit(&mut self.engine.page_table, page);
        self.engine.stats.lock().unwrap().record_fault();

        if let Some(victim) = decision.victim {
            self.evict(victim, decision.victim_clean)?;
        }
        self.fetch(page, page_addr, decision.new_page_protection)?;

        self.record_access(page);
        self.maybe_begin_prefetch(page)?;
        Ok(())
    }

    fn record_access(&mut self, page: u32) {
        let (_, last) = self.fault_history;
        self.fault_history = (last, Some(page));
    }

    /// A page's outstanding prefetch, if any, resolves here rather than on
    /// its own schedule: the next fault is the only place the engine is
    /// guaranteed to run again. Returns `Ok(true)` if the prefetch satisfied
    /// this fault outright (the caller need not admit/evict/fetch).
    fn resolve_prefetch(&mut self, page: u32, page_addr: usize) -> Result<bool, MasterError> {
        let Some(op) = self.engine.slots.take_prefetch() else {
            return Ok(false);
        };
        let transport = &self.transport;
        let data = self
            .runtime
            .block_on(async move { transport.fetch_end(op.handle).await })?;

        let hit = op.page_index == page;
        self.engine.stats.lock().unwrap().record_prefetch_outcome(hit);
        if !hit {
            trace!(prefetched = op.page_index, faulted = page, "prefetch missed, discarding");
            return Ok(false);
        }

        let page_size = self.engine.region.page_size as usize;
        let decision = self.engine.policy.admit(&mut self.engine.page_table, page);
        if let Some(victim) = decision.victim {
            self.evict(victim, decision.victim_clean)?;
        }
        set_protection(page_addr, page_size, Protection::ReadWrite)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), page_addr as *mut u8, page_size);
        }
        if decision.new_page_protection != Protection::ReadWrite {
            set_protection(page_addr, page_size, decision.new_page_protection)?;
        }
        self.engine.stats.lock().unwrap().record_fetch(page_size as u64);
        Ok(true)
    }

    /// After resolving `page`, speculatively begin fetching the policy's
    /// guess at what comes next. Only meaningful for policies whose
    /// residency is observable through the fault path (`supports_prefetch`),
    /// and only one prefetch may be outstanding at a time.
    fn maybe_begin_prefetch(&mut self, page: u32) -> Result<(), MasterError> {
        if !self.engine.policy.supports_prefetch() || self.engine.slots.prefetch_outstanding() {
            return Ok(());
        }
        let Some(candidate) = self.prefetch_candidate(page) else {
            return Ok(());
        };
        if candidate >= self.engine.region.num_pages() as u32 || self.engine.page_table.contains(candidate) {
            return Ok(());
        }

        let page_size = self.engine.region.page_size as usize;
        let holder = self.engine.region.holder_of_page(candidate);
        let transport = &self.transport;
        let handle = self
            .runtime
            .block_on(async move { transport.fetch_begin(to_transport_holder(holder), page_size).await })?;
        self.engine.slots.begin_prefetch(candidate, handle);
        Ok(())
    }

    fn prefetch_candidate(&self, page: u32) -> Option<u32> {
        match self.engine.config.prefetch {
            PrefetchMode::None => None,
            PrefetchMode::Next => Some(page + 1),
            PrefetchMode::Delta => {
                let (prev, _last) = self.fault_history;
                let prev = prev?;
                let delta = page as i64 - prev as i64;
                let candidate = page as i64 + delta;
                if candidate < 0 {
                    None
                } else {
                    Some(candidate as u32)
                }
            }
        }
    }

    fn freeze_peer_threads(&mut self, faulting: ThreadId) {
        let targets = self.engine.threads.freeze_targets(faulting);
        let mut wave = dsm_engine::threads::FreezeWave::new(targets.clone(), self.freeze_timeout);
        for slot in targets.clone() {
            let Some(rec) = self.engine.threads.get(slot) else {
                wave.thread_gone(slot);
                continue;
            };
            if !signal::freeze_thread(rec.os_tid.0 as libc::pid_t) {
                wave.thread_gone(slot);
                self.engine.threads.remove(slot);
            }
        }
        loop {
            if wave.is_complete() {
                break;
            }
            if wave.timed_out() {
                warn!("freeze wave timed out, proceeding best-effort");
                break;
            }
            let pending: Vec<usize> = wave.pending_slots().collect();
            for slot in pending {
                let Some(rec) = self.engine.threads.get(slot) else {
                    wave.acknowledge(slot);
                    continue;
                };
                let runnable = thread_state_char(rec.os_tid.0 as libc::pid_t).map(|c| c == 'R');
                if rec.blocked_on_lock || runnable != Some(true) {
                    wave.acknowledge(slot);
                }
            }
            if !wave.is_complete() {
                std::thread::sleep(Duration::from_micros(200));
            }
        }
        for slot in targets {
            if let Some(rec) = self.engine.threads.get_mut(slot) {
                rec.handler_cancel_counter += 1;
            }
        }
    }

    /// Begins (and, unless staged, completes) the write-back of a victim
    /// page. With `config.async_evict` set, only `evict_begin` is awaited
    /// here; completion is deferred to [`Self::complete_pending_evict`] at
    /// the top of the next fault, per the configured staged-eviction mode.
    fn evict(&mut self, victim: u32, clean: bool) -> Result<(), MasterError> {
        if clean {
            trace!(victim, "victim is clean, skipping the write-back");
            return Ok(());
        }
        let page_size = self.engine.region.page_size as usize;
        let victim_addr = self.engine.region.addr_of_page(victim);
        set_protection(victim_addr, page_size, Protection::ReadOnly)?;
        let bytes = unsafe { std::slice::from_raw_parts(victim_addr as *const u8, page_size) }.to_vec();
        let holder = self.engine.region.holder_of_page(victim);

        if self.engine.config.async_evict {
            let transport = &self.transport;
            let bytes_for_begin = bytes.clone();
            let handle = self
                .runtime
                .block_on(async move { transport.evict_begin(to_transport_holder(holder), bytes_for_begin).await })?;
            self.engine.slots.begin_evict(victim, handle, true, bytes);
            return Ok(());
        }

        let transport = &self.transport;
        self.runtime.block_on(async move {
            let handle = transport
                .evict_begin(to_transport_holder(holder), bytes)
                .await?;
            transport.evict_end(handle).await
        })?;
        self.engine.stats.lock().unwrap().record_evict(page_size as u64);
        Ok(())
    }

    /// Finishes a staged evict left outstanding by a previous fault. A no-op
    /// under synchronous eviction, where `evict` never leaves anything
    /// pending.
    fn complete_pending_evict(&mut self) -> Result<(), MasterError> {
        let Some(op) = self.engine.slots.take_evict() else {
            return Ok(());
        };
        let page_size = op.buffer.len() as u64;
        let transport = &self.transport;
        self.runtime
            .block_on(async move { transport.evict_end(op.handle).await })?;
        self.engine.stats.lock().unwrap().record_evict(page_size);
        Ok(())
    }

    fn fetch(&mut self, page: u32, page_addr: usize, final_prot: Protection) -> Result<(), MasterError> {
        if !self.engine.config.memcpy {
            warn!("MEMCPY=0 requested but this transport only exchanges owned buffers; falling back to the copy path");
        }
        let page_size = self.engine.region.page_size as usize;
        let holder = self.engine.region.holder_of_page(page);
        let transport = &self.transport;
        let data = self.runtime.block_on(async move {
            let handle = transport
                .fetch_begin(to_transport_holder(holder), page_size)
                .await?;
            transport.fetch_end(handle).await
        })?;

        set_protection(page_addr, page_size, Protection::ReadWrite)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), page_addr as *mut u8, page_size);
        }
        if final_prot != Protection::ReadWrite {
            set_protection(page_addr, page_size, final_prot)?;
        }
        self.engine.stats.lock().unwrap().record_fetch(page_size as u64);
        Ok(())
    }
}

fn to_transport_holder(h: Holder) -> dsm_transport::Holder {
    dsm_transport::Holder {
        rank: h.rank,
        offset: h.offset,
    }
}
