//! Pure logic for finding rank-identifying environment variables, kept
//! separate from the CLI and the filesystem so it can be tested directly.

use std::collections::{BTreeMap, BTreeSet};

pub type EnvDump = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    /// `value` equals the peer's own rank, on every peer in the run.
    MatchesRank,
    /// Present in rank 0's environment but absent from every other peer's.
    Rank0Only,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub key: String,
    pub kind: Candidate,
}

/// `dumps` maps rank to that rank's environment snapshot. Rank 0 must be
/// present; peers are every other entry.
pub fn find_candidates(dumps: &BTreeMap<u32, EnvDump>) -> Vec<Finding> {
    let Some(rank0) = dumps.get(&0) else {
        return Vec::new();
    };
    let peers: Vec<(&u32, &EnvDump)> = dumps.iter().filter(|(rank, _)| **rank != 0).collect();

    let mut all_keys: BTreeSet<&str> = rank0.keys().map(String::as_str).collect();
    for (_, dump) in &peers {
        all_keys.extend(dump.keys().map(String::as_str));
    }

    let mut findings = Vec::new();
    for key in all_keys {
        if matches_rank_everywhere(key, &peers) {
            findings.push(Finding {
                key: key.to_string(),
                kind: Candidate::MatchesRank,
            });
            continue;
        }
        if rank0.contains_key(key) && peers.iter().all(|(_, dump)| !dump.contains_key(key)) {
            findings.push(Finding {
                key: key.to_string(),
                kind: Candidate::Rank0Only,
            });
        }
    }
    findings
}

fn matches_rank_everywhere(key: &str, peers: &[(&u32, &EnvDump)]) -> bool {
    if peers.is_empty() {
        return false;
    }
    peers.iter().all(|(rank, dump)| {
        dump.get(key)
            .map(|value| value == &rank.to_string())
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dump(pairs: &[(&str, &str)]) -> EnvDump {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn finds_variable_matching_rank_on_every_peer() {
        let mut dumps = BTreeMap::new();
        dumps.insert(0, dump(&[("PMI_RANK", "0"), ("PATH", "/bin")]));
        dumps.insert(1, dump(&[("PMI_RANK", "1"), ("PATH", "/bin")]));
        dumps.insert(2, dump(&[("PMI_RANK", "2"), ("PATH", "/bin")]));

        let findings = find_candidates(&dumps);
        assert!(findings.contains(&Finding {
            key: "PMI_RANK".to_string(),
            kind: Candidate::MatchesRank,
        }));
        assert!(!findings.iter().any(|f| f.key == "PATH"));
    }

    #[test]
    fn finds_variable_present_only_on_rank_zero() {
        let mut dumps = BTreeMap::new();
        dumps.insert(0, dump(&[("IS_LAUNCHER", "1")]));
        dumps.insert(1, dump(&[]));
        dumps.insert(2, dump(&[]));

        let findings = find_candidates(&dumps);
        assert_eq!(
            findings,
            vec![Finding {
                key: "IS_LAUNCHER".to_string(),
                kind: Candidate::Rank0Only,
            }]
        );
    }

    #[test]
    fn a_variable_with_the_same_fixed_value_everywhere_is_not_a_candidate() {
        let mut dumps = BTreeMap::new();
        dumps.insert(0, dump(&[("HOSTTYPE", "x86_64")]));
        dumps.insert(1, dump(&[("HOSTTYPE", "x86_64")]));

        assert!(find_candidates(&dumps).is_empty());
    }

    #[test]
    fn with_no_peers_nothing_can_match_rank_but_rank0_only_still_applies() {
        let mut dumps = BTreeMap::new();
        dumps.insert(0, dump(&[("SOLO", "1")]));

        let findings = find_candidates(&dumps);
        assert_eq!(
            findings,
            vec![Finding {
                key: "SOLO".to_string(),
                kind: Candidate::Rank0Only,
            }]
        );
    }
}
