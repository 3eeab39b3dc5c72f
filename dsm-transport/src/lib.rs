//! Transport adapters over which the master fetches and evicts pages.
//! Two implementations share one contract ([`Transport`]): a message-passing
//! variant (`tcp`, this crate's only built backend, standing in for the
//! message-passing variant the spec calls out) and a sketched one-sided
//! put/get variant left as an extension point behind the same trait.

pub mod error;
pub mod protocol;
pub mod tcp;

pub use error::TransportError;

/// Where a page's authoritative bytes live, as the transport sees it: a
/// peer rank and a byte offset into that peer's buffer. Mirrors
/// `dsm_engine::region::Holder` without creating a dependency edge from the
/// transport crate back onto the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Holder {
    pub rank: u32,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct PeerInit {
    pub my_rank: u32,
    pub num_ranks: u32,
    pub agreed_page_size: u64,
    pub negotiated_per_peer_bytes: u64,
}

/// The contract both transport variants implement. `Handle` is opaque to
/// callers: it is created by a `_begin` call and consumed by the matching
/// `_end` call, and is exactly what `dsm_engine::slots::AsyncSlots` stores
/// while an operation is outstanding.
pub trait Transport: Send + Sync {
    type Handle: Send;

    /// Negotiate rank, peer count, and the agreed page/buffer sizing.
    /// Peers other than rank 0 enter their serve loop here and never
    /// return this future to the caller's startup sequence.
    fn peer_init(
        &mut self,
    ) -> impl std::future::Future<Output = Result<PeerInit, TransportError>> + Send;

    /// Begin an asynchronous read of one page's worth of bytes from
    /// `holder`.
    fn fetch_begin(
        &self,
        holder: Holder,
        page_size: usize,
    ) -> impl std::future::Future<Output = Result<Self::Handle, TransportError>> + Send;

    fn fetch_end(
        &self,
        handle: Self::Handle,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Begin an asynchronous write of `data` to `holder`.
    fn evict_begin(
        &self,
        holder: Holder,
        data: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<Self::Handle, TransportError>> + Send;

    fn evict_end(
        &self,
        handle: Self::Handle,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Broadcast termination to every peer. Idempotent from the master's
    /// point of view; a peer that already exited is not an error.
    fn finalize(&self) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;
}
