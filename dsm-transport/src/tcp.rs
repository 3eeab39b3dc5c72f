//! Variant A of the transport contract, built on plain `tokio` TCP streams
//! rather than an MPI binding: one long-lived connection per peer, framed
//! with the tagged protocol from [`crate::protocol`]. Fetches and evicts
//! are each driven from a spawned task so `fetch_end`/`evict_end` can be
//! awaited independently of when the operation was started, matching the
//! asynchronous fetch/evict pipeline the engine drives.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::protocol::{decode_offset, encode_offset, Tag};
use crate::{Holder, PeerInit, Transport};

/// One TCP connection per peer rank, held by the master.
pub struct TcpTransport {
    connections: Vec<Arc<Mutex<TcpStream>>>,
    my_rank: u32,
    num_ranks: u32,
    page_size: u64,
    heterogeneous: bool,
}

/// The in-flight operation a `_begin` call hands back.
pub enum TcpHandle {
    Fetch(JoinHandle<Result<Vec<u8>, TransportError>>),
    Evict(JoinHandle<Result<(), TransportError>>),
}

impl TcpTransport {
    /// Dial every peer and perform the handshake that assigns ranks and
    /// agrees on page size / per-peer byte budget. Called by rank 0 only;
    /// peers instead call [`serve_peer_connection`] in a loop.
    pub async fn connect_as_master(
        peer_addrs: &[SocketAddr],
        page_size: u64,
        per_peer_bytes: u64,
        heterogeneous: bool,
    ) -> Result<Self, TransportError> {
        let num_ranks = peer_addrs.len() as u32 + 1;
        let mut connections = Vec::with_capacity(peer_addrs.len());
        for (i, addr) in peer_addrs.iter().enumerate() {
            let rank = i as u32 + 1;
            let mut stream = TcpStream::connect(addr)
                .await
                .map_err(TransportError::Io)?;
            send_handshake(&mut stream, rank, num_ranks, page_size, per_peer_bytes, heterogeneous)
                .await?;
            debug!(rank, %addr, "connected to peer");
            connections.push(Arc::new(Mutex::new(stream)));
        }
        Ok(TcpTransport {
            connections,
            my_rank: 0,
            num_ranks,
            page_size,
            heterogeneous,
        })
    }

    fn connection(&self, rank: u32) -> Result<Arc<Mutex<TcpStream>>, TransportError> {
        self.connections
            .get(rank as usize - 1)
            .cloned()
            .ok_or(TransportError::NoConnection { rank })
    }
}

async fn send_handshake(
    stream: &mut TcpStream,
    rank: u32,
    num_ranks: u32,
    page_size: u64,
    per_peer_bytes: u64,
    heterogeneous: bool,
) -> Result<(), TransportError> {
    let mut buf = Vec::with_capacity(4 + 4 + 8 + 8 + 1);
    buf.extend_from_slice(&rank.to_ne_bytes());
    buf.extend_from_slice(&num_ranks.to_ne_bytes());
    buf.extend_from_slice(&encode_offset(page_size, heterogeneous));
    buf.extend_from_slice(&encode_offset(per_peer_bytes, heterogeneous));
    buf.push(heterogeneous as u8);
    stream.write_all(&buf).await.map_err(TransportError::Io)?;
    let mut ack = [0u8; 1];
    stream.read_exact(&mut ack).await.map_err(TransportError::Io)?;
    if ack[0] != 1 {
        return Err(TransportError::HandshakeFailed(format!(
            "peer {rank} rejected handshake"
        )));
    }
    Ok(())
}

impl Transport for TcpTransport {
    type Handle = TcpHandle;

    async fn peer_init(&mut self) -> Result<PeerInit, TransportError> {
        Ok(PeerInit {
            my_rank: self.my_rank,
            num_ranks: self.num_ranks,
            agreed_page_size: self.page_size,
            negotiated_per_peer_bytes: 0,
        })
    }

    async fn fetch_begin(
        &self,
        holder: Holder,
        page_size: usize,
    ) -> Result<Self::Handle, TransportError> {
        let conn = self.connection(holder.rank)?;
        let heterogeneous = self.heterogeneous;
        let handle = tokio::spawn(async move {
            let mut guard = conn.lock().await;
            guard
                .write_all(&[Tag::Get.as_u8()])
                .await
                .map_err(TransportError::Io)?;
            guard
                .write_all(&encode_offset(holder.offset, heterogeneous))
                .await
                .map_err(TransportError::Io)?;
            let mut tag_byte = [0u8; 1];
            guard.read_exact(&mut tag_byte).await.map_err(TransportError::Io)?;
            if Tag::from_u8(tag_byte[0]) != Some(Tag::Response) {
                return Err(TransportError::HandshakeFailed(format!(
                    "expected RESPONSE, got tag {}",
                    tag_byte[0]
                )));
            }
            let mut data = vec![0u8; page_size];
            guard.read_exact(&mut data).await.map_err(TransportError::Io)?;
            Ok(data)
        });
        Ok(TcpHandle::Fetch(handle))
    }

    async fn fetch_end(&self, handle: Self::Handle) -> Result<Vec<u8>, TransportError> {
        match handle {
            TcpHandle::Fetch(jh) => jh
                .await
                .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?,
            TcpHandle::Evict(_) => Err(TransportError::HandshakeFailed(
                "fetch_end called with an evict handle".into(),
            )),
        }
    }

    async fn evict_begin(
        &self,
        holder: Holder,
        data: Vec<u8>,
    ) -> Result<Self::Handle, TransportError> {
        let conn = self.connection(holder.rank)?;
        let heterogeneous = self.heterogeneous;
        let handle = tokio::spawn(async move {
            let mut guard = conn.lock().await;
            guard
                .write_all(&[Tag::PutOffset.as_u8()])
                .await
                .map_err(TransportError::Io)?;
            guard
                .write_all(&encode_offset(holder.offset, heterogeneous))
                .await
                .map_err(TransportError::Io)?;
            guard
                .write_all(&[Tag::PutData.as_u8()])
                .await
                .map_err(TransportError::Io)?;
            guard.write_all(&data).await.map_err(TransportError::Io)?;
            Ok(())
        });
        Ok(TcpHandle::Evict(handle))
    }

    async fn evict_end(&self, handle: Self::Handle) -> Result<(), TransportError> {
        match handle {
            TcpHandle::Evict(jh) => jh
                .await
                .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?,
            TcpHandle::Fetch(_) => Err(TransportError::HandshakeFailed(
                "evict_end called with a fetch handle".into(),
            )),
        }
    }

    async fn finalize(&self) -> Result<(), TransportError> {
        for (i, conn) in self.connections.iter().enumerate() {
            let mut guard = conn.lock().await;
            if let Err(e) = guard.write_all(&[Tag::Terminate.as_u8()]).await {
                warn!(rank = i as u32 + 1, error = %e, "failed to deliver TERMINATE");
            }
        }
        Ok(())
    }
}

/// Peer-side handshake receipt: accepted from the listener the peer binds
/// before entering its serve loop (see `dsm-peer`).
pub async fn accept_handshake(
    listener: &TcpListener,
) -> Result<(TcpStream, PeerInit, bool), TransportError> {
    let (mut stream, addr) = listener.accept().await.map_err(TransportError::Io)?;
    let mut header = [0u8; 4 + 4 + 8 + 8 + 1];
    stream.read_exact(&mut header).await.map_err(TransportError::Io)?;
    let heterogeneous = header[24] != 0;
    let my_rank = u32::from_ne_bytes(header[0..4].try_into().unwrap());
    let num_ranks = u32::from_ne_bytes(header[4..8].try_into().unwrap());
    let agreed_page_size = decode_offset(header[8..16].try_into().unwrap(), heterogeneous);
    let negotiated_per_peer_bytes = decode_offset(header[16..24].try_into().unwrap(), heterogeneous);
    stream.write_all(&[1u8]).await.map_err(TransportError::Io)?;
    debug!(%addr, my_rank, num_ranks, "accepted master handshake");
    Ok((
        stream,
        PeerInit {
            my_rank,
            num_ranks,
            agreed_page_size,
            negotiated_per_peer_bytes,
        },
        heterogeneous,
    ))
}

/// Serve GET/PUT requests over one accepted connection against `buffer`
/// until a TERMINATE tag arrives or the connection closes. Shared by
/// `dsm-peer`'s event loop.
pub async fn serve_peer_connection(
    mut stream: TcpStream,
    buffer: Arc<Mutex<Vec<u8>>>,
    page_size: usize,
    heterogeneous: bool,
) -> Result<(), TransportError> {
    loop {
        let mut tag_byte = [0u8; 1];
        if stream.read_exact(&mut tag_byte).await.is_err() {
            return Ok(());
        }
        match Tag::from_u8(tag_byte[0]) {
            Some(Tag::Terminate) => return Ok(()),
            Some(Tag::Get) => {
                let mut off_bytes = [0u8; 8];
                stream.read_exact(&mut off_bytes).await.map_err(TransportError::Io)?;
                let offset = decode_offset(off_bytes, heterogeneous) as usize;
                let buf = buffer.lock().await;
                stream
                    .write_all(&[Tag::Response.as_u8()])
                    .await
                    .map_err(TransportError::Io)?;
                stream
                    .write_all(&buf[offset..offset + page_size])
                    .await
                    .map_err(TransportError::Io)?;
            }
            Some(Tag::PutOffset) => {
                let mut off_bytes = [0u8; 8];
                stream.read_exact(&mut off_bytes).await.map_err(TransportError::Io)?;
                let offset = decode_offset(off_bytes, heterogeneous) as usize;
                let mut data_tag = [0u8; 1];
                stream.read_exact(&mut data_tag).await.map_err(TransportError::Io)?;
                if Tag::from_u8(data_tag[0]) != Some(Tag::PutData) {
                    return Err(TransportError::Protocol(
                        crate::protocol::ProtocolError::OutOfSequence {
                            got: Tag::from_u8(data_tag[0]).unwrap_or(Tag::Terminate),
                            state: crate::protocol::SequenceState::AwaitingPutData,
                        },
                    ));
                }
                let mut page = vec![0u8; page_size];
                stream.read_exact(&mut page).await.map_err(TransportError::Io)?;
                let mut buf = buffer.lock().await;
                buf[offset..offset + page_size].copy_from_slice(&page);
            }
            Some(Tag::PutData) | Some(Tag::Response) => {
                return Err(TransportError::Protocol(
                    crate::protocol::ProtocolError::OutOfSequence {
                        got: Tag::from_u8(tag_byte[0]).unwrap(),
                        state: crate::protocol::SequenceState::Idle,
                    },
                ));
            }
            None => return Err(TransportError::Protocol(crate::protocol::ProtocolError::UnknownTag(tag_byte[0]))),
        }
    }
}
