//! Multithread coordination: the process-wide recursive lock and the
//! per-thread bookkeeping the fault handler consults when freezing peer
//! user threads. The actual signal delivery that makes a frozen thread stop
//! running lives in `dsm-master`; this module only owns the data structures
//! and the wave protocol around them, so it can be exercised without an OS.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Opaque OS thread identifier, as reported by the interception layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u64);

#[derive(Debug, Clone)]
pub struct ThreadRecord {
    pub transport_id: u32,
    pub os_tid: ThreadId,
    pub blocked_on_lock: bool,
    pub lock_recursion_depth: u32,
    pub handler_cancel_counter: u32,
    pub is_internal: bool,
    pub freeable: bool,
}

impl ThreadRecord {
    pub fn new(transport_id: u32, os_tid: ThreadId, is_internal: bool) -> Self {
        ThreadRecord {
            transport_id,
            os_tid,
            blocked_on_lock: false,
            lock_recursion_depth: 0,
            handler_cancel_counter: 0,
            is_internal,
            freeable: true,
        }
    }
}

/// The live-thread list. Conceptually singly linked in the original system;
/// here a slab with a free list gives the same "insert on first touch,
/// remove when observed dead" lifecycle without unsafe pointer chasing.
#[derive(Default)]
pub struct ThreadRegistry {
    slab: Vec<Option<ThreadRecord>>,
    free: Vec<usize>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        ThreadRegistry::default()
    }

    pub fn insert(&mut self, record: ThreadRecord) -> usize {
        if let Some(slot) = self.free.pop() {
            self.slab[slot] = Some(record);
            slot
        } else {
            self.slab.push(Some(record));
            self.slab.len() - 1
        }
    }

    /// Remove a thread observed dead during a freeze wave.
    pub fn remove(&mut self, slot: usize) -> Option<ThreadRecord> {
        let rec = self.slab.get_mut(slot).and_then(Option::take);
        if rec.is_some() {
            self.free.push(slot);
        }
        rec
    }

    pub fn get(&self, slot: usize) -> Option<&ThreadRecord> {
        self.slab.get(slot).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut ThreadRecord> {
        self.slab.get_mut(slot).and_then(Option::as_mut)
    }

    pub fn find_slot(&self, tid: ThreadId) -> Option<usize> {
        self.slab
            .iter()
            .position(|r| matches!(r, Some(rec) if rec.os_tid == tid))
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ThreadRecord)> {
        self.slab
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|rec| (i, rec)))
    }

    /// Threads that must be frozen for a fault serviced by `faulting`:
    /// every live, non-internal thread other than the one taking the fault.
    pub fn freeze_targets(&self, faulting: ThreadId) -> Vec<usize> {
        self.iter()
            .filter(|(_, rec)| rec.os_tid != faulting && !rec.is_internal)
            .map(|(slot, _)| slot)
            .collect()
    }
}

/// Tracks one freeze wave in progress: which targeted threads have not yet
/// been observed blocked-on-lock or dead. The caller (the interception
/// layer) delivers the actual signal and calls [`FreezeWave::acknowledge`]
/// or [`FreezeWave::thread_gone`] as it observes each target's state.
pub struct FreezeWave {
    pending: VecDeque<usize>,
    started: Instant,
    per_thread_timeout: Duration,
}

impl FreezeWave {
    pub fn new(targets: Vec<usize>, per_thread_timeout: Duration) -> Self {
        FreezeWave {
            pending: targets.into_iter().collect(),
            started: Instant::now(),
            per_thread_timeout,
        }
    }

    pub fn acknowledge(&mut self, slot: usize) {
        self.pending.retain(|&s| s != slot);
    }

    /// A thread died mid-wave (signal delivery reported "no such process").
    /// Dead threads count as frozen; the registry entry is removed
    /// separately by the caller.
    pub fn thread_gone(&mut self, slot: usize) {
        self.acknowledge(slot);
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    /// The wave has run past its bounded timeout and should proceed
    /// best-effort, per the documented accepted race.
    pub fn timed_out(&self) -> bool {
        self.started.elapsed() >= self.per_thread_timeout
    }

    pub fn pending_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.pending.iter().copied()
    }
}

/// A process-wide recursive lock: a thread already holding it may acquire
/// it again without blocking, and must release it the same number of times.
/// Matches the "lock acquisition recorded in per-thread state so reentrant
/// entries do not block" rule: core code nests freely (fault handler calling
/// into the allocator calling into the page table) without deadlocking
/// itself.
pub struct GlobalLock {
    state: Mutex<LockState>,
    cv: Condvar,
}

struct LockState {
    holder: Option<ThreadId>,
    depth: u32,
}

impl Default for GlobalLock {
    fn default() -> Self {
        GlobalLock::new()
    }
}

impl GlobalLock {
    pub fn new() -> Self {
        GlobalLock {
            state: Mutex::new(LockState {
                holder: None,
                depth: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Acquire the lock for `tid`, blocking if another thread holds it.
    /// Returns the recursion depth after this acquisition (1 on a fresh,
    /// non-reentrant acquire).
    pub fn acquire(&self, tid: ThreadId) -> u32 {
        let mut guard = self.state.lock().unwrap();
        loop {
            match guard.holder {
                Some(h) if h == tid => {
                    guard.depth += 1;
                    return guard.depth;
                }
                None => {
                    guard.holder = Some(tid);
                    guard.depth = 1;
                    return 1;
                }
                Some(_) => {
                    guard = self.cv.wait(guard).unwrap();
                }
            }
        }
    }

    /// Release one level of acquisition. Panics if `tid` does not hold the
    /// lock, mirroring the fatal-invariant treatment of lock misuse.
    pub fn release(&self, tid: ThreadId) {
        let mut guard = self.state.lock().unwrap();
        assert_eq!(guard.holder, Some(tid), "release by a thread not holding the lock");
        guard.depth -= 1;
        if guard.depth == 0 {
            guard.holder = None;
            self.cv.notify_one();
        }
    }

    pub fn held_by(&self, tid: ThreadId) -> bool {
        self.state.lock().unwrap().holder == Some(tid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_targets_exclude_faulting_thread_and_internal_threads() {
        let mut reg = ThreadRegistry::new();
        let faulting = reg.insert(ThreadRecord::new(0, ThreadId(1), false));
        let peer = reg.insert(ThreadRecord::new(0, ThreadId(2), false));
        let internal = reg.insert(ThreadRecord::new(0, ThreadId(3), true));
        let targets = reg.freeze_targets(ThreadId(1));
        assert_eq!(targets, vec![peer]);
        let _ = (faulting, internal);
    }

    #[test]
    fn wave_completes_once_every_target_acknowledges() {
        let mut reg = ThreadRegistry::new();
        let a = reg.insert(ThreadRecord::new(0, ThreadId(10), false));
        let b = reg.insert(ThreadRecord::new(0, ThreadId(11), false));
        let mut wave = FreezeWave::new(vec![a, b], Duration::from_millis(50));
        assert!(!wave.is_complete());
        wave.acknowledge(a);
        assert!(!wave.is_complete());
        wave.thread_gone(b);
        assert!(wave.is_complete());
    }

    #[test]
    fn recursive_lock_allows_reentry_from_the_same_thread() {
        let lock = GlobalLock::new();
        let tid = ThreadId(1);
        assert_eq!(lock.acquire(tid), 1);
        assert_eq!(lock.acquire(tid), 2);
        lock.release(tid);
        assert!(lock.held_by(tid));
        lock.release(tid);
        assert!(!lock.held_by(tid));
    }

    #[test]
    #[should_panic(expected = "release by a thread not holding the lock")]
    fn release_without_holding_is_fatal() {
        let lock = GlobalLock::new();
        lock.release(ThreadId(99));
    }

    #[test]
    fn removed_thread_is_gone_and_slot_is_reused() {
        let mut reg = ThreadRegistry::new();
        let a = reg.insert(ThreadRecord::new(0, ThreadId(1), false));
        reg.remove(a);
        assert!(reg.get(a).is_none());
        let b = reg.insert(ThreadRecord::new(0, ThreadId(2), false));
        assert_eq!(b, a);
    }
}
