//! Helper invoked by the launch wrapper, not by the engine itself: run
//! `dump` once on every node to snapshot that node's environment, then run
//! `analyze` against the collected snapshots to see which variables look
//! rank-identifying. Rank 0's snapshot anchors the comparison.

mod analyze;

use std::collections::BTreeMap;
use std::path::PathBuf;

use analyze::{Candidate, EnvDump};
use clap::{Parser, Subcommand};
use thiserror::Error;

#[derive(Parser)]
#[command(
    name = "dsm-rankenv",
    version,
    about = "Finds environment variables a launch wrapper sets per-rank"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Snapshot this process's environment as JSON, to stdout or a file.
    Dump {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Compare rank 0's snapshot against every peer's and report candidates.
    Analyze {
        #[arg(long)]
        rank0: PathBuf,
        /// One `RANK=path` pair per peer, e.g. `--peer 1=/tmp/rank1.json`.
        #[arg(long = "peer", value_parser = parse_peer_arg)]
        peers: Vec<(u32, PathBuf)>,
    },
}

#[derive(Debug, Error)]
enum RankEnvError {
    #[error("could not read snapshot {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse snapshot {path} as JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn parse_peer_arg(s: &str) -> Result<(u32, PathBuf), String> {
    let (rank, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected RANK=path, got {s:?}"))?;
    let rank: u32 = rank.parse().map_err(|_| format!("{rank:?} is not a valid rank"))?;
    Ok((rank, PathBuf::from(path)))
}

fn current_env_dump() -> EnvDump {
    std::env::vars().collect()
}

fn load_dump(path: &PathBuf) -> Result<EnvDump, RankEnvError> {
    let contents = std::fs::read_to_string(path).map_err(|source| RankEnvError::Read {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| RankEnvError::Parse {
        path: path.clone(),
        source,
    })
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Dump { out } => {
            let dump = current_env_dump();
            let json = serde_json::to_string_pretty(&dump).expect("environment serializes to JSON");
            match out {
                Some(path) => {
                    if let Err(e) = std::fs::write(&path, json) {
                        eprintln!("failed to write {}: {e}", path.display());
                        std::process::exit(1);
                    }
                }
                None => println!("{json}"),
            }
        }
        Command::Analyze { rank0, peers } => {
            let mut dumps = BTreeMap::new();
            match load_dump(&rank0) {
                Ok(dump) => {
                    dumps.insert(0, dump);
                }
                Err(e) => {
                    eprintln!("{e}");
                    std::process::exit(1);
                }
            }
            for (rank, path) in &peers {
                match load_dump(path) {
                    Ok(dump) => {
                        dumps.insert(*rank, dump);
                    }
                    Err(e) => {
                        eprintln!("{e}");
                        std::process::exit(1);
                    }
                }
            }

            let findings = analyze::find_candidates(&dumps);
            if findings.is_empty() {
                println!("no rank-identifying environment variables found");
                return;
            }
            for finding in findings {
                match finding.kind {
                    Candidate::MatchesRank => println!("{}: value equals rank on every peer", finding.key),
                    Candidate::Rank0Only => println!("{}: defined only on rank 0", finding.key),
                }
            }
        }
    }
}
