//! Guest RPC: the framed JSON protocol spoken over vsock between the host
//! manager and the in-guest agent, plus the host-side client.

pub mod client;
pub mod protocol;

pub use client::GuestClient;
pub use protocol::{
    read_frame, write_frame, FileEntry, GuestRequest, GuestResponse, MAX_FRAME_BYTES,
    PROTOCOL_VERSION,
};

use thiserror::Error;

/// Failures on the guest RPC channel. Channel errors are distinct from
/// guest-reported operation errors so callers can tell a dead transport
/// from a live guest saying no.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("connect to {path}: {source}")]
    Connect {
        path: String,
        source: std::io::Error,
    },

    #[error("vsock handshake failed: {0}")]
    Handshake(String),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("connection closed mid-frame")]
    ConnectionClosed,

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("guest reported: {0}")]
    Guest(String),

    /// The guest answered with a response variant the request cannot produce.
    #[error("unexpected response for {op}")]
    UnexpectedResponse { op: &'static str },

    #[error("transport: {0}")]
    Io(#[from] std::io::Error),
}
