mod buffer;
mod ram_probe;
mod serve_loop;

use std::net::SocketAddr;

use dsm_engine::config::Config;
use ram_probe::ReserveSpec;
use tracing_subscriber::EnvFilter;

fn reserve_spec_from_config(config: &Config) -> Option<ReserveSpec> {
    match config.reserve_mem {
        None => None,
        Some(dsm_engine::config::ByteOrPercent::Bytes(b)) => Some(ReserveSpec::Bytes(b)),
        Some(dsm_engine::config::ByteOrPercent::Percent(p)) => Some(ReserveSpec::Percent(p)),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "peer configuration invalid");
            std::process::exit(1);
        }
    };

    let os_page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    let page_size = config.page_size.unwrap_or(os_page_size as u64) as usize;

    let available = match ram_probe::probe_available_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "RAM probe failed");
            std::process::exit(1);
        }
    };
    let mut budget = ram_probe::apply_reserve(available, reserve_spec_from_config(&config));
    if let Some(slave_mem) = config.slave_mem {
        budget = budget.min(slave_mem);
    }
    tracing::info!(available, budget, "sized local buffer");

    let final_len = if config.reduce_mem {
        buffer::reduce_until_fault_free(budget as usize, page_size)
    } else {
        budget as usize
    };

    let mut local_buffer = vec![0u8; final_len];
    if config.mlock {
        buffer::try_mlock(local_buffer.as_ptr(), local_buffer.len());
    }
    // touched once up front so the pages are actually backed before serving.
    for b in local_buffer.iter_mut() {
        *b = 0;
    }

    let port = config.peer_base_port;
    let listen_addr: SocketAddr = format!("0.0.0.0:{port}").parse().expect("valid listen address");

    if let Err(e) = serve_loop::run(listen_addr, local_buffer, page_size).await {
        tracing::error!(error = %e, "peer event loop exited with an error");
        std::process::exit(1);
    }
}
