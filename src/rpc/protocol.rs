//! Wire protocol shared by the host client and the guest agent.
//!
//! Frames are a 4-byte big-endian length followed by a JSON document. The
//! request and response types are closed tagged enums; anything that does not
//! deserialize into them is rejected at the boundary before any handler runs.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::RpcError;

/// Bumped on any incompatible wire change. Carried in `Ping` so a version
/// skew between host and guest image fails loudly at boot.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame. Large file transfers should be chunked by
/// the caller; this bound protects both sides from a hostile length prefix.
pub const MAX_FRAME_BYTES: u32 = 32 * 1024 * 1024;

/// Operations the host may ask of the guest agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GuestRequest {
    /// Liveness and version probe; the first request on every boot.
    Ping { version: u32 },
    /// Run a shell command inside the guest.
    Execute {
        command: String,
        /// Deadline in milliseconds enforced inside the guest.
        timeout_ms: u64,
    },
    WriteFile {
        path: String,
        #[serde(with = "base64_bytes")]
        contents: Vec<u8>,
    },
    ReadFile { path: String },
    ListFiles { path: String },
}

impl GuestRequest {
    /// Stable label for logs and the per-op latency metric.
    pub fn op_name(&self) -> &'static str {
        match self {
            GuestRequest::Ping { .. } => "ping",
            GuestRequest::Execute { .. } => "execute",
            GuestRequest::WriteFile { .. } => "write_file",
            GuestRequest::ReadFile { .. } => "read_file",
            GuestRequest::ListFiles { .. } => "list_files",
        }
    }
}

/// One directory entry from `ListFiles`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

/// Agent replies, tagged by outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum GuestResponse {
    Pong { version: u32 },
    Executed {
        stdout: String,
        stderr: String,
        exit_code: i32,
        /// True when the command was killed at its deadline.
        timed_out: bool,
    },
    Written { bytes: u64 },
    FileContents {
        #[serde(with = "base64_bytes")]
        contents: Vec<u8>,
    },
    FileList { entries: Vec<FileEntry> },
    /// The operation itself failed inside the guest.
    Error { message: String },
}

/// Serialize `msg` and write it as one length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(msg)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_BYTES {
        return Err(RpcError::FrameTooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and deserialize it. `Ok(None)` is a clean EOF at a frame
/// boundary; EOF inside a frame is an error.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, RpcError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(RpcError::FrameTooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|_| RpcError::ConnectionClosed)?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

/// Binary payloads travel as base64 strings so the frames stay valid JSON.
/// The standard engine rejects malformed input, so a corrupted frame fails
/// deserialization instead of silently truncating.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
