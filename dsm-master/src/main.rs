use clap::Parser;
use tracing_subscriber::EnvFilter;

/// The master process: everything is normally driven by the environment
/// table of the launch wrapper, but a verbosity override is handy when
/// running one node by hand.
#[derive(Parser)]
#[command(name = "dsm-master", version, about = "Master-side software paging engine")]
struct Cli {
    /// Overrides RUST_LOG for this run, e.g. `-v dsm_master=trace`.
    #[arg(short, long)]
    verbose: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let filter = match cli.verbose {
        Some(spec) => EnvFilter::new(spec),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = dsm_master::startup::run().await {
        tracing::error!(error = %e, "master process aborting");
        std::process::exit(1);
    }
}
