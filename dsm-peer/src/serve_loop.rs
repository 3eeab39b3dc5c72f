//! The peer's event loop: accept the master's connection, then serve
//! GET/PUT requests against the local buffer until TERMINATE. A background
//! task periodically touches the buffer's pages, standing in for the
//! original busy-touch-while-polling behavior without burning a whole core
//! doing it.

use std::sync::Arc;
use std::time::Duration;

use dsm_transport::tcp::{accept_handshake, serve_peer_connection};
use dsm_transport::TransportError;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::info;

fn touch_loop(buffer: Arc<Mutex<Vec<u8>>>, page_size: usize, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let mut buf = buffer.lock().await;
            let mut off = 0;
            while off < buf.len() {
                buf[off] = buf[off];
                off += page_size.max(1);
            }
        }
    })
}

/// Bind, accept the master's single connection, and serve until TERMINATE.
/// Returns once the master has finalized the run.
pub async fn run(listen_addr: std::net::SocketAddr, buffer: Vec<u8>, page_size: usize) -> Result<(), TransportError> {
    let listener = TcpListener::bind(listen_addr).await.map_err(TransportError::Io)?;
    info!(%listen_addr, "peer listening for the master");

    let (stream, peer_init, heterogeneous) = accept_handshake(&listener).await?;
    info!(rank = peer_init.my_rank, "peer handshake accepted");

    let shared = Arc::new(Mutex::new(buffer));
    let _touch = touch_loop(shared.clone(), page_size, Duration::from_millis(250));

    serve_peer_connection(stream, shared, page_size, heterogeneous).await?;
    info!("received TERMINATE, peer event loop exiting");
    Ok(())
}
