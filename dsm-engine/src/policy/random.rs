use rand::Rng;

use super::{AdmitDecision, PolicyPayload, ReplacementPolicy};
use crate::page_table::PageTable;
use crate::protection::Protection;

/// Uniform random replacement, excluding the most recently admitted page
/// from candidacy so two pages cannot thrash each other out forever.
pub struct RandomPolicy {
    capacity: usize,
    last_admitted: Option<u32>,
}

impl RandomPolicy {
    pub fn new(capacity: usize) -> Self {
        RandomPolicy {
            capacity,
            last_admitted: None,
        }
    }

    fn pick_victim(&self, table: &PageTable<PolicyPayload>) -> u32 {
        let len = table.len();
        let mut rng = rand::thread_rng();
        loop {
            let r = rng.gen_range(0..len);
            let (idx, _) = table.at_rank(r).expect("rank within len must exist");
            if len == 1 || Some(idx) != self.last_admitted {
                return idx;
            }
        }
    }
}

impl ReplacementPolicy for RandomPolicy {
    fn admit(&mut self, table: &mut PageTable<PolicyPayload>, faulting_page: u32) -> AdmitDecision {
        let victim = if table.len() >= self.capacity {
            Some(self.pick_victim(table))
        } else {
            None
        };
        if let Some(v) = victim {
            table.delete(v).expect("random victim must be resident");
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
        "random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_evicts_the_page_it_just_admitted() {
        let cap = 4;
        let mut table: PageTable<PolicyPayload> = PageTable::new(cap);
        let mut policy = RandomPolicy::new(cap);
        for p in 0..cap as u32 {
            policy.admit(&mut table, p);
        }
        let mut last = policy.last_admitted;
        for p in cap as u32..cap as u32 * 20 {
            let d = policy.admit(&mut table, p);
            assert_ne!(d.victim, last, "must not immediately re-evict last admission");
            last = Some(p);
        }
    }
}
