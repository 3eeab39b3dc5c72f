use rand::Rng;

use super::{AdmitDecision, PolicyPayload, ReplacementPolicy};
use crate::page_table::PageTable;
use crate::protection::Protection;

/// Not-recently-used: each resident page carries a `(referenced, modified)`
/// bit pair. Eviction scans the four classes in priority order
/// `(0,0) -> (0,1) -> (1,0) -> (1,1)` and picks uniformly within the first
/// nonempty class. A periodic sweep clears every `referenced` bit so the
/// classes reflect recent, not merely historical, access.
///
/// Pages are admitted read-only unless `nru_rw` is set, so that the first
/// touch after admission or after a sweep is observable as a protection
/// fault and can set the reference bit; a write fault on an already
/// read-only resident page upgrades it in place.
pub struct NruPolicy {
    capacity: usize,
    nru_rw: bool,
    interval_ms: u64,
    last_sweep_ms: u64,
}

impl NruPolicy {
    pub fn new(capacity: usize, nru_rw: bool, interval_ms: u64) -> Self {
        NruPolicy {
            capacity,
            nru_rw,
            interval_ms,
            last_sweep_ms: 0,
        }
    }

    fn pick_victim(&self, table: &PageTable<PolicyPayload>) -> u32 {
        let mut classes: [Vec<u32>; 4] = Default::default();
        for (page, payload) in table.iter() {
            let (r, m) = payload.as_nru().expect("nru policy requires Nru payloads");
            let class = match (r, m) {
                (false, false) => 0,
                (false, true) => 1,
                (true, false) => 2,
                (true, true) => 3,
            };
            classes[class].push(page);
        }
        for class in classes.iter() {
            if !class.is_empty() {
                let mut rng = rand::thread_rng();
                let i = rng.gen_range(0..class.len());
                return class[i];
            }
        }
        unreachable!("page table is nonempty so some class must be nonempty")
    }
}

impl ReplacementPolicy for NruPolicy {
    fn admit(&mut self, table: &mut PageTable<PolicyPayload>, faulting_page: u32) -> AdmitDecision {
        let victim = if table.len() >= self.capacity {
            Some(self.pick_victim(table))
        } else {
            None
        };
        if let Some(v) = victim {
            table.delete(v).expect("nru victim must be resident");
        }
        table
            .insert(
                faulting_page,
                PolicyPayload::Nru {
                    referenced: true,
                    modified: false,
                },
            )
            .expect("slot freed by delete must be available for the reusing insert");

        let new_page_protection = if self.nru_rw {
            Protection::ReadWrite
        } else {
            Protection::ReadOnly
        };

        AdmitDecision {
            new_page_protection,
            victim,
            victim_clean: false,
        }
    }

    fn on_write_upgrade(&mut self, table: &mut PageTable<PolicyPayload>, page: u32) -> Protection {
        if let Some(payload) = table.find_mut(page) {
            *payload = PolicyPayload::Nru {
                referenced: true,
                modified: true,
            };
        }
        Protection::ReadWrite
    }

    fn sweep_if_due(&mut self, table: &mut PageTable<PolicyPayload>, now_ms: u64) {
        if now_ms.saturating_sub(self.last_sweep_ms) < self.interval_ms {
            return;
        }
        self.last_sweep_ms = now_ms;
        for (_, payload) in table.iter_mut() {
            if let PolicyPayload::Nru { referenced, modified } = payload {
                *referenced = false;
                let _ = modified;
            }
        }
    }

    fn supports_prefetch(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "nru"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_read_only_unless_rw_forced() {
        let mut table: PageTable<PolicyPayload> = PageTable::new(4);
        let mut policy = NruPolicy::new(4, false, 1_000);
        let d = policy.admit(&mut table, 1);
        assert_eq!(d.new_page_protection, Protection::ReadOnly);

        let mut policy_rw = NruPolicy::new(4, true, 1_000);
        let mut table_rw: PageTable<PolicyPayload> = PageTable::new(4);
        let d_rw = policy_rw.admit(&mut table_rw, 1);
        assert_eq!(d_rw.new_page_protection, Protection::ReadWrite);
    }

    #[test]
    fn write_upgrade_sets_both_bits() {
        let mut table: PageTable<PolicyPayload> = PageTable::new(4);
        let mut policy = NruPolicy::new(4, false, 1_000);
        policy.admit(&mut table, 1);
        let prot = policy.on_write_upgrade(&mut table, 1);
        assert_eq!(prot, Protection::ReadWrite);
        assert_eq!(table.find(1).unwrap().as_nru(), Some((true, true)));
    }

    #[test]
    fn prefers_evicting_unreferenced_unmodified_pages() {
        let mut table: PageTable<PolicyPayload> = PageTable::new(3);
        let mut policy = NruPolicy::new(3, false, 1_000);
        policy.admit(&mut table, 1);
        policy.admit(&mut table, 2);
        policy.admit(&mut table, 3);
        policy.on_write_upgrade(&mut table, 1);
        policy.on_write_upgrade(&mut table, 2);
        // pages 1 and 2 are now (true, true); page 3 is still (true, false),
        // the only member of the lowest nonempty class
        let d = policy.admit(&mut table, 4);
        assert_eq!(d.victim, Some(3));
    }

    #[test]
    fn sweep_clears_referenced_bits_but_not_modified() {
        let mut table: PageTable<PolicyPayload> = PageTable::new(4);
        let mut policy = NruPolicy::new(4, false, 100);
        policy.admit(&mut table, 1);
        policy.on_write_upgrade(&mut table, 1);
        policy.sweep_if_due(&mut table, 200);
        assert_eq!(table.find(1).unwrap().as_nru(), Some((false, true)));
        // before the interval elapses again, a second sweep is a no-op
        policy.sweep_if_due(&mut table, 250);
        assert_eq!(policy.last_sweep_ms, 200);
    }
}
