//! The master's initialization sequence: configuration, logging, the peer
//! handshake, region reservation, engine assembly, the fault handler, and
//! the heartbeat — in that order, with any failure in the first six steps
//! treated as a fatal environmental error before user code ever runs.

use std::net::SocketAddr;
use std::time::Duration;

use dsm_engine::config::Config;
use dsm_engine::error::EnvironmentalError;
use dsm_engine::region::RegionLayout;
use dsm_engine::Engine;
use dsm_transport::tcp::TcpTransport;
use dsm_transport::Transport;
use tracing::info;

use crate::error::MasterError;
use crate::fault_service::FaultService;
use crate::{heartbeat, interception, region_alloc, signal};

fn peer_addrs_from_env() -> Result<Vec<SocketAddr>, MasterError> {
    let raw = std::env::var("MASTER_PEER_ADDRS").unwrap_or_default();
    let mut addrs = Vec::new();
    for part in raw.split(',').filter(|s| !s.is_empty()) {
        let addr: SocketAddr = part.parse().map_err(|_| {
            dsm_engine::error::EngineError::Environmental(EnvironmentalError::InvalidConfig {
                key: "MASTER_PEER_ADDRS",
                value: part.to_string(),
                reason: "expected a host:port".into(),
            })
        })?;
        addrs.push(addr);
    }
    Ok(addrs)
}

/// Runs the full startup sequence and blocks servicing faults until
/// `finalize` is driven from elsewhere (the stubbed harness in `main.rs`
/// never reaches that point; a real embedding drives it from the user
/// program's exit path).
pub async fn run() -> Result<(), MasterError> {
    // (1) configuration
    let config = Config::from_env()?;

    // (2) logging — initialized by the binary before calling `run`.

    // (3) peer handshake
    let peer_addrs = peer_addrs_from_env()?;
    let os_page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
    let page_size = config.page_size.unwrap_or(os_page_size.max(4096));
    let slave_mem = config.slave_mem.unwrap_or(256 * 1024 * 1024);
    let mut transport =
        TcpTransport::connect_as_master(&peer_addrs, page_size, slave_mem, config.heterogeneous)
            .await
            .map_err(MasterError::Transport)?;
    let peer_init = transport.peer_init().await.map_err(MasterError::Transport)?;
    info!(
        num_ranks = peer_init.num_ranks,
        page_size = peer_init.agreed_page_size,
        "peer handshake complete"
    );

    // (4) local cache sizing and region reservation
    let master_free = config.master_mem.unwrap_or(2u64 * 1024 * 1024 * 1024);
    let max_mappings = 60_000u64;
    let default_local_pages =
        RegionLayout::default_local_pages(master_free, page_size, max_mappings);
    let local_pages = match config.local_pages {
        Some(dsm_engine::config::LocalPagesOverride::Count(n)) => n as u64,
        Some(dsm_engine::config::LocalPagesOverride::PercentOfMax(pct)) => {
            default_local_pages * pct as u64 / 100
        }
        None => default_local_pages,
    };
    if local_pages == 0 {
        let env_err = EnvironmentalError::CachePageAllocFailed { requested: 1 };
        return Err(dsm_engine::error::EngineError::from(env_err).into());
    }

    let num_peers = (peer_init.num_ranks - 1).max(1);
    let per_peer_bytes = slave_mem;
    let base = region_alloc::reserve_region(per_peer_bytes * num_peers as u64, page_size, config.base_addr)?;
    let region = RegionLayout {
        base,
        page_size,
        per_peer_bytes,
        num_peers,
        distribution: config.distribution,
    };
    region_alloc::prefault_cold_prefix(base, local_pages, page_size)?;

    // (5) engine assembly
    let internal_heap_base = base + region.extent() as usize + page_size as usize;
    let internal_heap_limit = 256 * 1024 * 1024;
    let mut engine: Engine<<TcpTransport as Transport>::Handle> = Engine::new(
        config.clone(),
        region,
        local_pages as usize,
        internal_heap_base,
        internal_heap_limit,
    )?;

    // (6) fault handler and interception shims (the shims themselves are
    // exported cdylib symbols active whenever this crate is preloaded; only
    // the signal handler and the two heaps need an explicit install call
    // here)
    let wake = signal::install(())?;
    interception::install_region_bounds(base, base + engine.region.extent() as usize);
    tracing::trace!(meminfo = %interception::synthesize_meminfo(engine.region.extent()), "synthesized /proc/meminfo view");
    let (external_heap, internal_heap) = engine.take_heaps();
    crate::heap_intercept::install(external_heap, internal_heap);

    // (7) heartbeat — shares the engine's own stats handle, so the periodic
    // log line reflects the same counters the fault path is updating rather
    // than a disconnected copy.
    let stats = engine.stats_handle();
    let _heartbeat = if config.heartbeat_secs > 0 {
        Some(heartbeat::spawn(stats, Duration::from_secs(config.heartbeat_secs)))
    } else {
        None
    };

    let mut service = FaultService::new(
        engine,
        transport,
        tokio::runtime::Handle::current(),
        wake,
        Duration::from_millis(50),
    );

    // (8) hand control to the user entry point — stubbed in this harness:
    // instead of exec'ing a user binary, service faults until told to stop.
    info!("initialization complete, servicing faults");
    loop {
        if let Err(e) = service.run_one_fault() {
            tracing::error!(error = %e, "fatal error servicing fault");
            return Err(e);
        }
    }
}
