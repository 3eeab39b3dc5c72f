use std::collections::VecDeque;

use super::{AdmitDecision, PolicyPayload, ReplacementPolicy};
use crate::page_table::PageTable;
use crate::protection::Protection;

/// FIFO replacement: a circular array of admitted page indices; the oldest
/// admission is always the next victim once the cache is full.
pub struct FifoPolicy {
    order: VecDeque<u32>,
    capacity: usize,
}

impl FifoPolicy {
    pub fn new(capacity: usize) -> Self {
        FifoPolicy {
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }
}

impl ReplacementPolicy for FifoPolicy {
    fn admit(&mut self, table: &mut PageTable<PolicyPayload>, faulting_page: u32) -> AdmitDecision {
        let victim = if table.len() >= self.capacity {
            self.order.pop_front()
        } else {
            None
        };
        if let Some(v) = victim {
            table.delete(v).expect("fifo victim must be resident");
        }
        table
            .insert(faulting_page, PolicyPayload::None)
            .expect("slot freed by delete must be available for the reusing insert");
        self.order.push_back(faulting_page);

        AdmitDecision {
            new_page_protection: Protection::ReadWrite,
            victim,
            victim_clean: false,
        }
    }

    fn name(&self) -> &'static str {
        "fifo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_in_admission_order_once_full() {
        let mut table: PageTable<PolicyPayload> = PageTable::new(3);
        let mut policy = FifoPolicy::new(3);
        for p in [1, 2, 3] {
            let d = policy.admit(&mut table, p);
            assert_eq!(d.victim, None);
        }
        let d = policy.admit(&mut table, 4);
        assert_eq!(d.victim, Some(1));
        let d = policy.admit(&mut table, 5);
        assert_eq!(d.victim, Some(2));
        let d = policy.admit(&mut table, 6);
        assert_eq!(d.victim, Some(3));
    }

    #[test]
    fn increasing_touch_workload_evicts_in_order() {
        let cap = 8;
        let mut table: PageTable<PolicyPayload> = PageTable::new(cap);
        let mut policy = FifoPolicy::new(cap);
        let mut evictions = Vec::new();
        for p in 0..cap as u32 * 3 {
            let d = policy.admit(&mut table, p);
            if let Some(v) = d.victim {
                evictions.push(v);
            }
        }
        let mut expected: Vec<u32> = (0..cap as u32 * 2).collect();
        assert_eq!(evictions, expected.drain(..).collect::<Vec<_>>());
    }
}
