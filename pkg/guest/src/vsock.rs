//! Firecracker hybrid vsock transports.
//!
//! Host-initiated: connect to the VM's vsock UDS and send `CONNECT <port>\n`;
//! Firecracker answers `OK <host_port>\n` and the stream is then connected to
//! the guest listener. Guest-initiated: Firecracker forwards a guest connect
//! on port P to `<uds>_P` on the host, so the host listens there.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::channel::{ExecResult, GuestChannel, SpawnResult};
use crate::connection::Connection;
use crate::error::GuestError;
use crate::protocol::{ExistsReply, FileContent, Op, ProcessExit};
use pkg_constants::runtime::SETUP_EXEC_TIMEOUT_MS;

const REACHABLE_TIMEOUT: Duration = Duration::from_secs(2);
const DIAL_RETRY: Duration = Duration::from_millis(100);
const HANDSHAKE_LINE_MAX: usize = 64;

enum Transport {
    Dial { uds: PathBuf, port: u32 },
    Listen { listener: Mutex<UnixListener>, path: PathBuf },
    Attached,
}

pub struct VsockChannel {
    transport: Transport,
    conn: RwLock<Option<Arc<Connection>>>,
}

impl VsockChannel {
    /// Host-initiated channel. Nothing is dialled until first use.
    pub fn dial(uds: impl Into<PathBuf>, port: u32) -> Self {
        Self {
            transport: Transport::Dial {
                uds: uds.into(),
                port,
            },
            conn: RwLock::new(None),
        }
    }

    /// Guest-initiated channel: bind `<uds>_<port>` now so the guest can
    /// connect as soon as it boots.
    pub fn listen(uds: &Path, port: u32) -> Result<Self, GuestError> {
        let path = PathBuf::from(format!("{}_{}", uds.display(), port));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)
            .map_err(|e| GuestError::Unreachable(format!("bind {}: {}", path.display(), e)))?;
        debug!("[guest] listening on {}", path.display());
        Ok(Self {
            transport: Transport::Listen {
                listener: Mutex::new(listener),
                path,
            },
            conn: RwLock::new(None),
        })
    }

    /// Channel over an already connected stream.
    pub fn attach<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self {
            transport: Transport::Attached,
            conn: RwLock::new(Some(Arc::new(Connection::new(stream)))),
        }
    }

    /// Socket path the guest connects to, for listening channels.
    pub fn listen_path(&self) -> Option<&Path> {
        match &self.transport {
            Transport::Listen { path, .. } => Some(path),
            _ => None,
        }
    }

    async fn live(&self) -> Option<Arc<Connection>> {
        self.conn
            .read()
            .await
            .as_ref()
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// Current connection, dialling if this is a host-initiated channel.
    async fn connection(&self) -> Result<Arc<Connection>, GuestError> {
        if let Some(conn) = self.live().await {
            return Ok(conn);
        }
        match &self.transport {
            Transport::Dial { uds, port } => {
                let mut slot = self.conn.write().await;
                if let Some(conn) = slot.as_ref().filter(|c| !c.is_closed()) {
                    return Ok(conn.clone());
                }
                let stream = dial_stream(uds, *port).await?;
                let conn = Arc::new(Connection::new(stream));
                *slot = Some(conn.clone());
                Ok(conn)
            }
            Transport::Listen { .. } => Err(GuestError::Unreachable(
                "guest has not connected".to_string(),
            )),
            Transport::Attached => Err(GuestError::Disconnected),
        }
    }

    async fn call(&self, op: Op, timeout_ms: u64) -> Result<Value, GuestError> {
        let conn = self.connection().await?;
        conn.call(op, Duration::from_millis(timeout_ms)).await
    }

    async fn call_as<T: DeserializeOwned>(&self, op: Op, timeout_ms: u64) -> Result<T, GuestError> {
        let value = self.call(op, timeout_ms).await?;
        serde_json::from_value(value)
            .map_err(|e| GuestError::Protocol(format!("unexpected reply: {}", e)))
    }

    async fn ping(&self, conn: &Connection) -> Result<(), GuestError> {
        conn.call(Op::Ping, REACHABLE_TIMEOUT).await.map(|_| ())
    }
}

impl Drop for VsockChannel {
    fn drop(&mut self) {
        if let Transport::Listen { path, .. } = &self.transport {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Connect to the hybrid vsock socket and complete the CONNECT handshake.
pub async fn dial_stream(uds: &Path, port: u32) -> Result<UnixStream, GuestError> {
    let mut stream = UnixStream::connect(uds)
        .await
        .map_err(|e| GuestError::Unreachable(format!("connect {}: {}", uds.display(), e)))?;
    stream
        .write_all(format!("CONNECT {}\n", port).as_bytes())
        .await
        .map_err(|e| GuestError::Unreachable(e.to_string()))?;

    // Read byte-by-byte so nothing past the handshake line is consumed.
    let mut line = Vec::new();
    loop {
        let b = stream
            .read_u8()
            .await
            .map_err(|_| GuestError::Unreachable(format!("no agent on vsock port {}", port)))?;
        if b == b'\n' {
            break;
        }
        line.push(b);
        if line.len() > HANDSHAKE_LINE_MAX {
            return Err(GuestError::Protocol("handshake line too long".into()));
        }
    }
    let line = String::from_utf8_lossy(&line);
    if !line.starts_with("OK ") {
        return Err(GuestError::Unreachable(format!(
            "vsock handshake rejected: {}",
            line.trim()
        )));
    }
    Ok(stream)
}

#[async_trait]
impl GuestChannel for VsockChannel {
    async fn exec(
        &self,
        command: &str,
        timeout_ms: u64,
        env: &HashMap<String, String>,
    ) -> Result<ExecResult, GuestError> {
        self.call_as(
            Op::Exec {
                command: command.to_string(),
                timeout_ms,
                env: env.clone(),
            },
            timeout_ms,
        )
        .await
    }

    async fn spawn_and_watch(
        &self,
        command: &str,
        timeout_ms: u64,
        env: &HashMap<String, String>,
    ) -> Result<SpawnResult, GuestError> {
        self.call_as(
            Op::Spawn {
                command: command.to_string(),
                timeout_ms,
                env: env.clone(),
            },
            SETUP_EXEC_TIMEOUT_MS,
        )
        .await
    }

    async fn wait_for_exit(&self, pid: u32, timeout_ms: u64) -> Result<ProcessExit, GuestError> {
        let conn = self.connection().await?;
        conn.wait_exit(pid, Duration::from_millis(timeout_ms)).await
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), GuestError> {
        self.call(
            Op::WriteFile {
                path: path.to_string(),
                content: BASE64.encode(content),
                mode: None,
                sudo: false,
            },
            SETUP_EXEC_TIMEOUT_MS,
        )
        .await
        .map(|_| ())
    }

    async fn write_file_with_sudo(
        &self,
        path: &str,
        content: &[u8],
        mode: Option<u32>,
    ) -> Result<(), GuestError> {
        self.call(
            Op::WriteFile {
                path: path.to_string(),
                content: BASE64.encode(content),
                mode,
                sudo: true,
            },
            SETUP_EXEC_TIMEOUT_MS,
        )
        .await
        .map(|_| ())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, GuestError> {
        let reply: FileContent = self
            .call_as(
                Op::ReadFile {
                    path: path.to_string(),
                },
                SETUP_EXEC_TIMEOUT_MS,
            )
            .await?;
        BASE64
            .decode(reply.content)
            .map_err(|e| GuestError::Protocol(format!("invalid base64: {}", e)))
    }

    async fn mkdir(&self, path: &str) -> Result<(), GuestError> {
        self.call(
            Op::Mkdir {
                path: path.to_string(),
                sudo: false,
            },
            SETUP_EXEC_TIMEOUT_MS,
        )
        .await
        .map(|_| ())
    }

    async fn exists(&self, path: &str) -> Result<bool, GuestError> {
        let reply: ExistsReply = self
            .call_as(
                Op::Exists {
                    path: path.to_string(),
                },
                SETUP_EXEC_TIMEOUT_MS,
            )
            .await?;
        Ok(reply.exists)
    }

    async fn is_reachable(&self) -> bool {
        match self.connection().await {
            Ok(conn) => self.ping(&conn).await.is_ok(),
            Err(_) => false,
        }
    }

    async fn wait_for_guest_connection(&self, timeout_ms: u64) -> Result<(), GuestError> {
        let timeout = Duration::from_millis(timeout_ms);
        let started = Instant::now();
        match &self.transport {
            Transport::Listen { listener, path } => {
                if self.live().await.is_some() {
                    return Ok(());
                }
                let listener = listener.lock().await;
                let accepted = tokio::time::timeout(timeout, listener.accept()).await;
                let (stream, _) = match accepted {
                    Ok(res) => res.map_err(|e| GuestError::Unreachable(e.to_string()))?,
                    Err(_) => {
                        return Err(GuestError::Timeout {
                            op: format!("guest connect on {}", path.display()),
                            timeout_ms,
                        });
                    }
                };
                *self.conn.write().await = Some(Arc::new(Connection::new(stream)));
            }
            Transport::Dial { uds, port } => loop {
                let last_err = match self.connection().await {
                    Ok(conn) => match self.ping(&conn).await {
                        Ok(()) => break,
                        Err(e) => {
                            self.conn.write().await.take();
                            e
                        }
                    },
                    Err(e) => e,
                };
                if started.elapsed() >= timeout {
                    return Err(GuestError::Timeout {
                        op: format!(
                            "guest connect via {} port {} ({})",
                            uds.display(),
                            port,
                            last_err
                        ),
                        timeout_ms,
                    });
                }
                tokio::time::sleep(DIAL_RETRY).await;
            },
            Transport::Attached => {
                self.connection().await?;
            }
        }
        info!(
            "[guest] agent connected after {}ms",
            started.elapsed().as_millis()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{GuestMessage, Request, read_frame, write_frame};
    use tokio::io::DuplexStream;

    /// In-memory guest agent: answers requests until the host hangs up.
    /// Spawned processes "exit" after `exit_delay` with code 7.
    async fn fake_guest<S>(mut stream: S, exit_delay: Option<Duration>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut files: HashMap<String, Vec<u8>> = HashMap::new();
        let mut next_pid = 100u32;
        while let Ok(Some(req)) = read_frame::<_, Request>(&mut stream).await {
            let (ok, error) = match req.op {
                Op::Ping => (Some(Value::Null), None),
                Op::Exec { command, .. } if command == "sleep forever" => continue,
                Op::Exec { command, env, .. } => {
                    let exit_code = if command.starts_with("false") { 1 } else { 0 };
                    let stdout = match env.get("GREETING") {
                        Some(g) => format!("{} {}", g, command),
                        None => command.clone(),
                    };
                    let res = ExecResult {
                        exit_code,
                        stdout,
                        stderr: if exit_code == 0 { String::new() } else { "boom".into() },
                    };
                    (serde_json::to_value(res).ok(), None)
                }
                Op::Spawn { .. } => {
                    next_pid += 1;
                    let reply = GuestMessage::Response {
                        id: req.id,
                        ok: Some(serde_json::json!({ "pid": next_pid })),
                        error: None,
                    };
                    let exit = GuestMessage::ProcessExit(ProcessExit {
                        pid: next_pid,
                        exit_code: 7,
                        stdout: "done".into(),
                        stderr: String::new(),
                    });
                    match exit_delay {
                        // Push the exit before the spawn reply is even read.
                        None => {
                            write_frame(&mut stream, &reply).await.unwrap();
                            write_frame(&mut stream, &exit).await.unwrap();
                        }
                        Some(delay) => {
                            write_frame(&mut stream, &reply).await.unwrap();
                            tokio::time::sleep(delay).await;
                            write_frame(&mut stream, &exit).await.unwrap();
                        }
                    }
                    continue;
                }
                Op::WriteFile { path, content, .. } => {
                    files.insert(path, BASE64.decode(content).unwrap());
                    (None, None)
                }
                Op::ReadFile { path } => match files.get(&path) {
                    Some(data) => (
                        Some(serde_json::json!({ "content": BASE64.encode(data) })),
                        None,
                    ),
                    None => (None, Some(format!("{}: no such file", path))),
                },
                Op::Mkdir { path, .. } => {
                    files.insert(format!("{}/", path), Vec::new());
                    (None, None)
                }
                Op::Exists { path } => {
                    let exists =
                        files.contains_key(&path) || files.contains_key(&format!("{}/", path));
                    (Some(serde_json::json!({ "exists": exists })), None)
                }
            };
            let msg = GuestMessage::Response { id: req.id, ok, error };
            if write_frame(&mut stream, &msg).await.is_err() {
                break;
            }
        }
    }

    fn attached(exit_delay: Option<Duration>) -> VsockChannel {
        let (host, guest): (DuplexStream, DuplexStream) = tokio::io::duplex(64 * 1024);
        tokio::spawn(fake_guest(guest, exit_delay));
        VsockChannel::attach(host)
    }

    #[tokio::test]
    async fn exec_returns_nonzero_exit_as_result() {
        let ch = attached(None);
        let mut env = HashMap::new();
        env.insert("GREETING".to_string(), "hi".to_string());
        let ok = ch.exec("echo", 1_000, &env).await.unwrap();
        assert_eq!(ok.exit_code, 0);
        assert_eq!(ok.stdout, "hi echo");

        let failed = ch.exec("false", 1_000, &HashMap::new()).await.unwrap();
        assert_eq!(failed.exit_code, 1);
        assert!(!failed.success());
    }

    #[tokio::test]
    async fn exec_times_out() {
        let ch = attached(None);
        let err = ch
            .exec("sleep forever", 50, &HashMap::new())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_connectivity());
        // The channel survives a timed-out request.
        assert!(ch.is_reachable().await);
    }

    #[tokio::test]
    async fn exec_or_throw_fails_on_nonzero() {
        let ch = attached(None);
        assert_eq!(ch.exec_or_throw("true").await.unwrap(), "true");
        match ch.exec_or_throw("false --flag").await.unwrap_err() {
            GuestError::CommandFailed {
                command,
                exit_code,
                stderr,
            } => {
                assert_eq!(command, "false --flag");
                assert_eq!(exit_code, 1);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn spawn_with_early_exit_push() {
        let ch = attached(None);
        let spawned = ch
            .spawn_and_watch("run-agent", 10_000, &HashMap::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let exit = ch.wait_for_exit(spawned.pid, 1_000).await.unwrap();
        assert_eq!(exit.pid, spawned.pid);
        assert_eq!(exit.exit_code, 7);
        assert_eq!(exit.stdout, "done");
    }

    #[tokio::test]
    async fn spawn_with_late_exit_push() {
        let ch = attached(Some(Duration::from_millis(100)));
        let spawned = ch
            .spawn_and_watch("run-agent", 10_000, &HashMap::new())
            .await
            .unwrap();
        let exit = ch.wait_for_exit(spawned.pid, 5_000).await.unwrap();
        assert_eq!(exit.exit_code, 7);
    }

    #[tokio::test]
    async fn wait_for_exit_times_out() {
        let ch = attached(Some(Duration::from_secs(30)));
        let spawned = ch
            .spawn_and_watch("run-agent", 10_000, &HashMap::new())
            .await
            .unwrap();
        let err = ch.wait_for_exit(spawned.pid, 50).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn disconnect_is_a_connectivity_error() {
        let (host, guest) = tokio::io::duplex(1024);
        let ch = VsockChannel::attach(host);
        drop(guest);
        let err = ch.exec("ls", 1_000, &HashMap::new()).await.unwrap_err();
        assert!(err.is_connectivity(), "got {:?}", err);
        assert!(!ch.is_reachable().await);
    }

    #[tokio::test]
    async fn file_operations() {
        let ch = attached(None);
        ch.write_file("/home/user/a.txt", b"hello").await.unwrap();
        assert_eq!(ch.read_file("/home/user/a.txt").await.unwrap(), b"hello");
        ch.write_file_with_sudo("/usr/local/lib/fleetvm/run.sh", b"#!/bin/sh\n", Some(0o755))
            .await
            .unwrap();
        assert!(ch.exists("/usr/local/lib/fleetvm/run.sh").await.unwrap());

        assert!(!ch.exists("/data").await.unwrap());
        ch.mkdir("/data").await.unwrap();
        assert!(ch.exists("/data").await.unwrap());

        let err = ch.read_file("/missing").await.unwrap_err();
        assert!(matches!(err, GuestError::Remote(ref m) if m.contains("no such file")));
    }

    #[tokio::test]
    async fn dial_performs_connect_handshake() {
        let tmp = tempfile::tempdir().unwrap();
        let uds = tmp.path().join("vsock.sock");
        let listener = UnixListener::bind(&uds).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut line = Vec::new();
            loop {
                let b = stream.read_u8().await.unwrap();
                if b == b'\n' {
                    break;
                }
                line.push(b);
            }
            assert_eq!(line, b"CONNECT 1024");
            stream.write_all(b"OK 1073741824\n").await.unwrap();
            fake_guest(stream, None).await;
        });

        let ch = VsockChannel::dial(&uds, 1024);
        ch.wait_for_guest_connection(2_000).await.unwrap();
        assert!(ch.is_reachable().await);
        assert_eq!(ch.exec_or_throw("uname").await.unwrap(), "uname");
    }

    #[tokio::test]
    async fn dial_without_agent_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let ch = VsockChannel::dial(tmp.path().join("missing.sock"), 1024);
        assert!(!ch.is_reachable().await);
        let err = ch.wait_for_guest_connection(250).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn listen_accepts_guest_initiated_connection() {
        let tmp = tempfile::tempdir().unwrap();
        let uds = tmp.path().join("vsock.sock");
        let ch = VsockChannel::listen(&uds, 1025).unwrap();
        let path = ch.listen_path().unwrap().to_path_buf();
        assert_eq!(path, tmp.path().join("vsock.sock_1025"));
        assert!(!ch.is_reachable().await);

        tokio::spawn(async move {
            let mut stream = UnixStream::connect(&path).await.unwrap();
            write_frame(&mut stream, &GuestMessage::Hello { version: 1 })
                .await
                .unwrap();
            fake_guest(stream, None).await;
        });

        ch.wait_for_guest_connection(2_000).await.unwrap();
        assert!(ch.is_reachable().await);
        assert_eq!(ch.exec_or_throw("id").await.unwrap(), "id");
    }

    #[tokio::test]
    async fn listen_times_out_without_guest() {
        let tmp = tempfile::tempdir().unwrap();
        let ch = VsockChannel::listen(&tmp.path().join("vsock.sock"), 1025).unwrap();
        let err = ch.wait_for_guest_connection(50).await.unwrap_err();
        assert!(err.is_timeout());
        drop(ch);
        assert!(!tmp.path().join("vsock.sock_1025").exists());
    }
}
