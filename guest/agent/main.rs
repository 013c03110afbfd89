//! Guest agent - runs as the init payload inside each microVM.
//!
//! Listens on vsock for framed JSON requests from the host manager: run a
//! shell command, read/write/list files. Uses raw libc vsock calls for musl
//! compatibility (tokio_vsock causes GPF in musl-compiled guests).

use std::os::unix::io::FromRawFd;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use tokio::io::BufStream;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

use burrow::rpc::protocol::{
    read_frame, write_frame, FileEntry, GuestRequest, GuestResponse, PROTOCOL_VERSION,
};

const AF_VSOCK: libc::c_int = 40;
const SOCK_STREAM: libc::c_int = 1;
const VMADDR_CID_ANY: u32 = u32::MAX;
const VSOCK_PORT: u32 = 6000;

/// Default deadline when a request carries none.
const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

#[repr(C)]
struct SockaddrVm {
    svm_family: u16,
    svm_reserved1: u16,
    svm_port: u32,
    svm_cid: u32,
    svm_flags: u8,
    svm_zero: [u8; 3],
}

/// Create a vsock listener using raw libc (musl-compatible).
fn create_vsock_listener(port: u32) -> std::io::Result<std::os::unix::net::UnixListener> {
    let fd = unsafe { libc::socket(AF_VSOCK, SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let addr = SockaddrVm {
        svm_family: AF_VSOCK as u16,
        svm_reserved1: 0,
        svm_port: port,
        svm_cid: VMADDR_CID_ANY,
        svm_flags: 0,
        svm_zero: [0; 3],
    };

    let ret = unsafe {
        libc::bind(
            fd,
            &addr as *const SockaddrVm as *const libc::sockaddr,
            std::mem::size_of::<SockaddrVm>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    let ret = unsafe { libc::listen(fd, 128) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    // Non-blocking for tokio.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    // Wrap in UnixListener; works because vsock is SOCK_STREAM.
    Ok(unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) })
}

/// File operations are confined to this tree.
#[derive(Clone)]
struct AgentState {
    workdir: PathBuf,
}

impl AgentState {
    /// Resolve a request path inside the workdir. Absolute paths and `..`
    /// components are rejected so a caller cannot reach outside it.
    fn resolve(&self, raw: &str) -> Result<PathBuf, String> {
        let requested = Path::new(raw);
        let mut resolved = self.workdir.clone();
        for component in requested.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::RootDir | Component::Prefix(_) => {
                    return Err(format!("absolute paths are not allowed: {raw}"))
                }
                Component::ParentDir => {
                    return Err(format!("path escapes the workspace: {raw}"))
                }
            }
        }
        Ok(resolved)
    }

    async fn handle(&self, request: GuestRequest) -> GuestResponse {
        match request {
            GuestRequest::Ping { version } => {
                if version != PROTOCOL_VERSION {
                    warn!(host = version, guest = PROTOCOL_VERSION, "protocol skew");
                }
                GuestResponse::Pong {
                    version: PROTOCOL_VERSION,
                }
            }
            GuestRequest::Execute {
                command,
                timeout_ms,
            } => self.execute(&command, timeout_ms).await,
            GuestRequest::WriteFile { path, contents } => self.write_file(&path, contents).await,
            GuestRequest::ReadFile { path } => self.read_file(&path).await,
            GuestRequest::ListFiles { path } => self.list_files(&path).await,
        }
    }

    async fn execute(&self, command: &str, timeout_ms: u64) -> GuestResponse {
        let deadline = if timeout_ms > 0 {
            Duration::from_millis(timeout_ms)
        } else {
            DEFAULT_EXEC_TIMEOUT
        };
        debug!(%command, ?deadline, "execute");

        // BusyBox guests have no bash; /bin/sh is the portable choice.
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match timeout(deadline, cmd.output()).await {
            Ok(Ok(output)) => GuestResponse::Executed {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code().unwrap_or(-1),
                timed_out: false,
            },
            Ok(Err(e)) => GuestResponse::Error {
                message: format!("spawn failed: {e}"),
            },
            Err(_) => GuestResponse::Executed {
                stdout: String::new(),
                stderr: format!("command killed after {deadline:?}"),
                exit_code: -1,
                timed_out: true,
            },
        }
    }

    async fn write_file(&self, path: &str, contents: Vec<u8>) -> GuestResponse {
        let resolved = match self.resolve(path) {
            Ok(p) => p,
            Err(message) => return GuestResponse::Error { message },
        };
        if let Some(parent) = resolved.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return GuestResponse::Error {
                    message: format!("mkdir {}: {e}", parent.display()),
                };
            }
        }
        let bytes = contents.len() as u64;
        match tokio::fs::write(&resolved, contents).await {
            Ok(()) => GuestResponse::Written { bytes },
            Err(e) => GuestResponse::Error {
                message: format!("write {}: {e}", resolved.display()),
            },
        }
    }

    async fn read_file(&self, path: &str) -> GuestResponse {
        let resolved = match self.resolve(path) {
            Ok(p) => p,
            Err(message) => return GuestResponse::Error { message },
        };
        match tokio::fs::read(&resolved).await {
            Ok(contents) => GuestResponse::FileContents { contents },
            Err(e) => GuestResponse::Error {
                message: format!("read {}: {e}", resolved.display()),
            },
        }
    }

    async fn list_files(&self, path: &str) -> GuestResponse {
        let resolved = match self.resolve(path) {
            Ok(p) => p,
            Err(message) => return GuestResponse::Error { message },
        };
        let mut dir = match tokio::fs::read_dir(&resolved).await {
            Ok(dir) => dir,
            Err(e) => {
                return GuestResponse::Error {
                    message: format!("list {}: {e}", resolved.display()),
                }
            }
        };
        let mut entries = Vec::new();
        loop {
            match dir.next_entry().await {
                Ok(Some(entry)) => {
                    let meta = match entry.metadata().await {
                        Ok(meta) => meta,
                        Err(_) => continue,
                    };
                    entries.push(FileEntry {
                        name: entry.file_name().to_string_lossy().into_owned(),
                        size: meta.len(),
                        is_dir: meta.is_dir(),
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    return GuestResponse::Error {
                        message: format!("list {}: {e}", resolved.display()),
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        GuestResponse::FileList { entries }
    }
}

async fn serve_connection(state: AgentState, stream: tokio::net::UnixStream) {
    let mut stream = BufStream::new(stream);
    loop {
        let request: GuestRequest = match read_frame(&mut stream).await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                // Malformed or unknown request: answer with an error frame
                // when the transport still works, then drop the connection.
                warn!(error = %e, "rejected request");
                let _ = write_frame(
                    &mut stream,
                    &GuestResponse::Error {
                        message: format!("rejected: {e}"),
                    },
                )
                .await;
                return;
            }
        };

        let response = state.handle(request).await;
        if let Err(e) = write_frame(&mut stream, &response).await {
            warn!(error = %e, "response write failed");
            return;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_ansi(false)
        .init();

    let workdir = PathBuf::from(
        std::env::var("AGENT_WORKDIR").unwrap_or_else(|_| "/workspace".to_string()),
    );
    std::fs::create_dir_all(&workdir)?;
    let state = AgentState { workdir };

    let std_listener = create_vsock_listener(VSOCK_PORT)?;
    let listener = tokio::net::UnixListener::from_std(std_listener)?;
    info!(port = VSOCK_PORT, "agent listening");

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                debug!("connection accepted");
                tokio::spawn(serve_connection(state.clone(), stream));
            }
            Err(e) => {
                error!(error = %e, "accept failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> (tempfile::TempDir, AgentState) {
        let dir = tempfile::tempdir().unwrap();
        let state = AgentState {
            workdir: dir.path().to_path_buf(),
        };
        (dir, state)
    }

    #[test]
    fn paths_are_confined_to_the_workdir() {
        let (_dir, state) = state();
        assert!(state.resolve("notes/todo.txt").is_ok());
        assert!(state.resolve("./a/b").is_ok());
        assert!(state.resolve("../outside").is_err());
        assert!(state.resolve("a/../../outside").is_err());
        assert!(state.resolve("/etc/passwd").is_err());
    }

    #[tokio::test]
    async fn write_then_read_then_list() {
        let (_dir, state) = state();
        let written = state.write_file("out/data.bin", vec![1, 2, 3]).await;
        assert!(matches!(written, GuestResponse::Written { bytes: 3 }));

        match state.read_file("out/data.bin").await {
            GuestResponse::FileContents { contents } => assert_eq!(contents, vec![1, 2, 3]),
            other => panic!("unexpected: {other:?}"),
        }

        match state.list_files("out").await {
            GuestResponse::FileList { entries } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].name, "data.bin");
                assert_eq!(entries[0].size, 3);
                assert!(!entries[0].is_dir);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_of_missing_file_is_an_error_response() {
        let (_dir, state) = state();
        assert!(matches!(
            state.read_file("missing.txt").await,
            GuestResponse::Error { .. }
        ));
    }

    #[tokio::test]
    async fn execute_captures_output_and_exit_code() {
        let (_dir, state) = state();
        match state.execute("echo hello; exit 3", 5_000).await {
            GuestResponse::Executed {
                stdout,
                exit_code,
                timed_out,
                ..
            } => {
                assert_eq!(stdout, "hello\n");
                assert_eq!(exit_code, 3);
                assert!(!timed_out);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn execute_enforces_its_deadline() {
        let (_dir, state) = state();
        match state.execute("sleep 5", 100).await {
            GuestResponse::Executed {
                exit_code,
                timed_out,
                ..
            } => {
                assert_eq!(exit_code, -1);
                assert!(timed_out);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_reports_protocol_version() {
        let (_dir, state) = state();
        match state.handle(GuestRequest::Ping { version: PROTOCOL_VERSION }).await {
            GuestResponse::Pong { version } => assert_eq!(version, PROTOCOL_VERSION),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
