use std::collections::VecDeque;

use rand::Rng;

use super::{AdmitDecision, PolicyPayload, ReplacementPolicy};
use crate::page_table::PageTable;
use crate::protection::Protection;

/// Not-recently-evicted: a bounded eviction-history ring excludes the last
/// `NRE_ENTRIES` victims from candidacy, and the page just admitted is
/// excluded as well so two pages cannot thrash each other out forever. A
/// candidate is drawn uniformly at random and retried against the history
/// up to `retries` times; if every draw lands in the history the last draw
/// is evicted anyway rather than looping forever.
pub struct NrePolicy {
    capacity: usize,
    history: VecDeque<u32>,
    history_cap: usize,
    retries: u32,
    last_admitted: Option<u32>,
}

impl NrePolicy {
    pub fn new(capacity: usize, history_cap: usize, retries: u32) -> Self {
        NrePolicy {
            capacity,
            history: VecDeque::with_capacity(history_cap.max(1)),
            history_cap: history_cap.max(1),
            retries,
            last_admitted: None,
        }
    }

    fn record_eviction(&mut self, page: u32) {
        if self.history.len() == self.history_cap {
            self.history.pop_front();
        }
        self.history.push_back(page);
    }

    fn excluded(&self, idx: u32) -> bool {
        self.history.contains(&idx) || Some(idx) == self.last_admitted
    }

    fn pick_victim(&self, table: &PageTable<PolicyPayload>) -> u32 {
        let len = table.len();
        let mut rng = rand::thread_rng();
        let mut candidate = 0u32;
        for attempt in 0..=self.retries {
            let r = rng.gen_range(0..len);
            let (idx, _) = table.at_rank(r).expect("rank within len must exist");
            candidate = idx;
            if len == 1 || !self.excluded(idx) {
                return idx;
            }
            if attempt == self.retries {
                break;
            }
        }
        candidate
    }
}

impl ReplacementPolicy for NrePolicy {
    fn admit(&mut self, table: &mut PageTable<PolicyPayload>, faulting_page: u32) -> AdmitDecision {
        let victim = if table.len() >= self.capacity {
            Some(self.pick_victim(table))
        } else {
            None
        };
        if let Some(v) = victim {
            table.delete(v).expect("nre victim must be resident");
            self.record_eviction(v);
        }
        table
            .insert(faulting_page, PolicyPayload::None)
            .expect("slot freed by delete must be available for the reusing insert");
        self.last_admitted = Some(faulting_page);

        AdmitDecision {
            new_page_protection: Protection::ReadWrite,
            victim,
            victim_clean: false,
        }
    }

    fn name(&self) -> &'static str {
        "nre"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avoids_recently_evicted_pages_when_alternatives_exist() {
        let cap = 16;
        let mut table: PageTable<PolicyPayload> = PageTable::new(cap);
        let mut policy = NrePolicy::new(cap, 8, 20);
        for p in 0..cap as u32 {
            policy.admit(&mut table, p);
        }
        for p in cap as u32..cap as u32 * 10 {
            let d = policy.admit(&mut table, p);
            if let Some(v) = d.victim {
                let hist_without_v: Vec<u32> =
                    policy.history.iter().copied().filter(|&x| x != v).collect();
                assert!(
                    hist_without_v.len() + 1 <= policy.history_cap,
                    "history must stay bounded"
                );
            }
        }
    }

    #[test]
    fn never_evicts_the_page_it_just_admitted() {
        let cap = 8;
        let mut table: PageTable<PolicyPayload> = PageTable::new(cap);
        let mut policy = NrePolicy::new(cap, 3, 20);
        for p in 0..cap as u32 {
            policy.admit(&mut table, p);
        }
        let mut last = policy.last_admitted;
        for p in cap as u32..cap as u32 * 10 {
            let d = policy.admit(&mut table, p);
            assert_ne!(d.victim, last, "must not immediately re-evict last admission");
            last = Some(p);
        }
    }

    #[test]
    fn history_never_exceeds_its_cap() {
        let cap = 8;
        let mut table: PageTable<PolicyPayload> = PageTable::new(cap);
        let mut policy = NrePolicy::new(cap, 3, 5);
        for p in 0..cap as u32 * 20 {
            policy.admit(&mut table, p);
            assert!(policy.history.len() <= 3);
        }
    }
}
