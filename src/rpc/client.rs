//! Host-side guest RPC client.
//!
//! Firecracker exposes the guest vsock as a Unix socket on the host. Each
//! connection starts with a text handshake (`CONNECT <port>\n` answered by
//! `OK <host_port>\n`) before any payload bytes flow. The client opens a
//! fresh connection per request, which keeps failure handling simple and
//! avoids head-of-line blocking across concurrent callers.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::UnixStream;
use tracing::debug;

use super::protocol::{read_frame, write_frame, FileEntry, GuestRequest, GuestResponse};
use super::RpcError;
use crate::metrics;

/// Output of a guest `execute` call.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Client for one VM's guest agent.
#[derive(Debug, Clone)]
pub struct GuestClient {
    uds_path: PathBuf,
    port: u32,
}

impl GuestClient {
    pub fn new(uds_path: impl Into<PathBuf>, port: u32) -> Self {
        Self {
            uds_path: uds_path.into(),
            port,
        }
    }

    /// Probe the agent. Succeeds only when the agent is up and speaks the
    /// same protocol version.
    pub async fn ping(&self) -> Result<(), RpcError> {
        let response = self
            .call(&GuestRequest::Ping {
                version: super::PROTOCOL_VERSION,
            })
            .await?;
        match response {
            GuestResponse::Pong { version } if version == super::PROTOCOL_VERSION => Ok(()),
            GuestResponse::Pong { version } => Err(RpcError::Handshake(format!(
                "guest agent speaks protocol v{version}, host speaks v{}",
                super::PROTOCOL_VERSION
            ))),
            other => Err(unexpected("ping", other)),
        }
    }

    pub async fn execute(&self, command: &str, timeout_ms: u64) -> Result<ExecOutput, RpcError> {
        let response = self
            .call(&GuestRequest::Execute {
                command: command.to_string(),
                timeout_ms,
            })
            .await?;
        match response {
            GuestResponse::Executed {
                stdout,
                stderr,
                exit_code,
                timed_out,
            } => Ok(ExecOutput {
                stdout,
                stderr,
                exit_code,
                timed_out,
            }),
            other => Err(unexpected("execute", other)),
        }
    }

    pub async fn write_file(&self, path: &str, contents: Vec<u8>) -> Result<u64, RpcError> {
        let response = self
            .call(&GuestRequest::WriteFile {
                path: path.to_string(),
                contents,
            })
            .await?;
        match response {
            GuestResponse::Written { bytes } => Ok(bytes),
            other => Err(unexpected("write_file", other)),
        }
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, RpcError> {
        let response = self
            .call(&GuestRequest::ReadFile {
                path: path.to_string(),
            })
            .await?;
        match response {
            GuestResponse::FileContents { contents } => Ok(contents),
            other => Err(unexpected("read_file", other)),
        }
    }

    pub async fn list_files(&self, path: &str) -> Result<Vec<FileEntry>, RpcError> {
        let response = self
            .call(&GuestRequest::ListFiles {
                path: path.to_string(),
            })
            .await?;
        match response {
            GuestResponse::FileList { entries } => Ok(entries),
            other => Err(unexpected("list_files", other)),
        }
    }

    async fn call(&self, request: &GuestRequest) -> Result<GuestResponse, RpcError> {
        let op = request.op_name();
        let timer = metrics::GUEST_RPC_DURATION
            .with_label_values(&[op])
            .start_timer();

        let mut stream = BufStream::new(self.connect_and_handshake().await?);
        write_frame(&mut stream, request).await?;
        let response: GuestResponse = read_frame(&mut stream)
            .await?
            .ok_or(RpcError::ConnectionClosed)?;
        timer.observe_duration();

        debug!(op, "guest rpc complete");
        match response {
            GuestResponse::Error { message } => Err(RpcError::Guest(message)),
            other => Ok(other),
        }
    }

    async fn connect_and_handshake(&self) -> Result<UnixStream, RpcError> {
        let mut stream =
            UnixStream::connect(&self.uds_path)
                .await
                .map_err(|source| RpcError::Connect {
                    path: self.uds_path.display().to_string(),
                    source,
                })?;

        stream
            .write_all(format!("CONNECT {}\n", self.port).as_bytes())
            .await?;

        // Read the single-line handshake reply byte by byte; payload frames
        // follow immediately after the newline.
        let mut line = Vec::with_capacity(32);
        let mut byte = [0u8; 1];
        loop {
            let n = stream.read(&mut byte).await?;
            if n == 0 {
                return Err(RpcError::Handshake("connection closed during handshake".into()));
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
            if line.len() > 64 {
                return Err(RpcError::Handshake("oversized handshake reply".into()));
            }
        }

        let reply = String::from_utf8_lossy(&line);
        if reply.starts_with("OK ") {
            Ok(stream)
        } else {
            Err(RpcError::Handshake(reply.into_owned()))
        }
    }

    pub fn uds_path(&self) -> &Path {
        &self.uds_path
    }
}

fn unexpected(op: &'static str, response: GuestResponse) -> RpcError {
    debug!(op, ?response, "mismatched response variant");
    RpcError::UnexpectedResponse { op }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    fn serve_one(listener: UnixListener, reply: GuestResponse) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut line = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                stream.read_exact(&mut byte).await.unwrap();
                if byte[0] == b'\n' {
                    break;
                }
                line.push(byte[0]);
            }
            assert_eq!(line, b"CONNECT 6000");
            stream.write_all(b"OK 1024\n").await.unwrap();

            let mut stream = BufStream::new(stream);
            let request: GuestRequest = read_frame(&mut stream).await.unwrap().unwrap();
            assert_eq!(request.op_name(), "execute");
            write_frame(&mut stream, &reply).await.unwrap();
        })
    }

    #[tokio::test]
    async fn handshake_then_framed_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = serve_one(
            listener,
            GuestResponse::Executed {
                stdout: "hi\n".into(),
                stderr: String::new(),
                exit_code: 0,
                timed_out: false,
            },
        );

        let client = GuestClient::new(&path, 6000);
        let out = client.execute("echo hi", 5_000).await.unwrap();
        assert_eq!(out.stdout, "hi\n");
        assert_eq!(out.exit_code, 0);
        assert!(!out.timed_out);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn guest_error_reply_maps_to_rpc_guest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = serve_one(
            listener,
            GuestResponse::Error {
                message: "permission denied".into(),
            },
        );

        let client = GuestClient::new(&path, 6000);
        let err = client.execute("cat /etc/shadow", 5_000).await.unwrap_err();
        assert!(matches!(err, RpcError::Guest(m) if m.contains("permission denied")));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_handshake_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await;
            stream.write_all(b"KO connection refused\n").await.unwrap();
        });

        let client = GuestClient::new(&path, 6000);
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, RpcError::Handshake(_)));
    }

    #[tokio::test]
    async fn missing_socket_is_a_connect_error() {
        let client = GuestClient::new("/nonexistent/vsock.sock", 6000);
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, RpcError::Connect { .. }));
    }
}
