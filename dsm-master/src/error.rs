use thiserror::Error;

#[derive(Debug, Error)]
pub enum MasterError {
    #[error(transparent)]
    Engine(#[from] dsm_engine::error::EngineError),

    #[error(transparent)]
    Transport(#[from] dsm_transport::TransportError),

    #[error("mmap reservation of {size} bytes failed: {errno}")]
    MmapFailed { size: usize, errno: i32 },

    #[error("mprotect of [0x{addr:x}, 0x{addr:x}+{len:x}) to {prot:?} failed: {errno}")]
    MprotectFailed {
        addr: usize,
        len: usize,
        prot: dsm_engine::protection::Protection,
        errno: i32,
    },

    #[error("sigaction installation failed: {errno}")]
    SigactionFailed { errno: i32 },

    #[error("self-pipe creation failed: {errno}")]
    PipeFailed { errno: i32 },
}
