//! Client for the Firecracker API socket.
//!
//! Firecracker serves a small REST API over a Unix socket once the process
//! starts. Every non-2xx answer carries a `fault_message`; it is surfaced
//! as [`ApiError`] together with the status and request path.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::VmConfig;

/// Non-2xx answer from the API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("firecracker {path} returned {status}: {fault_message}")]
pub struct ApiError {
    pub status: u16,
    pub path: String,
    pub fault_message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum FirecrackerError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("firecracker transport error on {path}: {message}")]
    Transport { path: String, message: String },
    #[error("firecracker API at {} not ready after {timeout_ms}ms", .socket.display())]
    NotReady { socket: PathBuf, timeout_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotType {
    Full,
    Diff,
}

/// Where guest memory comes from when loading a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryBackend {
    File(PathBuf),
    /// Userfaultfd handler socket.
    Uffd(PathBuf),
}

impl MemoryBackend {
    fn to_json(&self) -> Value {
        let (backend_type, path) = match self {
            MemoryBackend::File(p) => ("File", p),
            MemoryBackend::Uffd(p) => ("Uffd", p),
        };
        json!({ "backend_type": backend_type, "backend_path": path })
    }
}

/// Rebinds a snapshotted interface to a different host TAP device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkOverride {
    pub iface_id: String,
    pub host_dev_name: String,
}

pub struct FirecrackerClient {
    socket: PathBuf,
    client: Client<UnixConnector, Full<Bytes>>,
}

impl FirecrackerClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            client: Client::unix(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Bytes, FirecrackerError> {
        let transport = |message: String| FirecrackerError::Transport {
            path: path.to_string(),
            message,
        };

        let uri: Uri = UnixUri::new(&self.socket, path).into();
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(uri)
            .header("accept", "application/json");
        let payload = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Full::new(Bytes::from(value.to_string()))
            }
            None => Full::new(Bytes::new()),
        };
        let request = builder
            .body(payload)
            .map_err(|e| transport(e.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| transport(e.to_string()))?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| transport(e.to_string()))?
            .to_bytes();

        debug!("[firecracker] {} {} → {}", method, path, status.as_u16());

        if !status.is_success() {
            return Err(ApiError {
                status: status.as_u16(),
                path: path.to_string(),
                fault_message: fault_message(&bytes),
            }
            .into());
        }
        Ok(bytes)
    }

    async fn put(&self, path: &str, body: Value) -> Result<(), FirecrackerError> {
        self.request(Method::PUT, path, Some(body)).await.map(|_| ())
    }

    async fn patch(&self, path: &str, body: Value) -> Result<(), FirecrackerError> {
        self.request(Method::PATCH, path, Some(body)).await.map(|_| ())
    }

    /// `GET /`: instance info.
    pub async fn describe(&self) -> Result<Value, FirecrackerError> {
        let bytes = self.request(Method::GET, "/", None).await?;
        Ok(serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    pub async fn pause(&self) -> Result<(), FirecrackerError> {
        self.patch("/vm", json!({ "state": "Paused" })).await
    }

    pub async fn resume(&self) -> Result<(), FirecrackerError> {
        self.patch("/vm", json!({ "state": "Resumed" })).await
    }

    /// The VM must be paused.
    pub async fn create_snapshot(
        &self,
        snapshot_type: SnapshotType,
        snapshot_path: &Path,
        mem_file_path: &Path,
    ) -> Result<(), FirecrackerError> {
        self.put(
            "/snapshot/create",
            json!({
                "snapshot_type": snapshot_type,
                "snapshot_path": snapshot_path,
                "mem_file_path": mem_file_path,
            }),
        )
        .await
    }

    pub async fn load_snapshot(
        &self,
        snapshot_path: &Path,
        memory: &MemoryBackend,
        resume_vm: bool,
        network_overrides: &[NetworkOverride],
    ) -> Result<(), FirecrackerError> {
        let mut body = json!({
            "snapshot_path": snapshot_path,
            "mem_backend": memory.to_json(),
            "resume_vm": resume_vm,
        });
        if !network_overrides.is_empty() {
            body["network_overrides"] = json!(network_overrides);
        }
        self.put("/snapshot/load", body).await
    }

    /// Block until the socket exists and the API answers.
    pub async fn wait_for_ready(
        &self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), FirecrackerError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.socket.exists() && self.describe().await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FirecrackerError::NotReady {
                    socket: self.socket.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Submit a full configuration and start the instance.
    pub async fn apply_config(&self, config: &VmConfig) -> Result<(), FirecrackerError> {
        self.put("/machine-config", json!(config.machine_config))
            .await?;
        self.put("/boot-source", json!(config.boot_source)).await?;
        for drive in &config.drives {
            self.put(&format!("/drives/{}", drive.drive_id), json!(drive))
                .await?;
        }
        for iface in &config.network_interfaces {
            self.put(
                &format!("/network-interfaces/{}", iface.iface_id),
                json!(iface),
            )
            .await?;
        }
        self.put("/vsock", json!(config.vsock)).await?;
        self.instance_start().await
    }

    pub async fn instance_start(&self) -> Result<(), FirecrackerError> {
        self.put("/actions", json!({ "action_type": "InstanceStart" }))
            .await
    }
}

/// `fault_message` from an error body, or the raw body if it isn't JSON.
fn fault_message(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct Fault {
        fault_message: String,
    }
    match serde_json::from_slice::<Fault>(body) {
        Ok(f) => f.fault_message,
        Err(_) => String::from_utf8_lossy(body).trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfigBuilder;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    #[derive(Debug, Clone)]
    struct Recorded {
        method: String,
        path: String,
        body: String,
    }

    /// Minimal HTTP/1.1 server: answers every request with `reply(path)`.
    fn serve(
        socket: &Path,
        reply: fn(&str) -> (u16, &'static str),
    ) -> Arc<Mutex<Vec<Recorded>>> {
        let listener = UnixListener::bind(socket).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let log = log2.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    let header_end = loop {
                        let n = stream.read(&mut chunk).await.unwrap();
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            break pos + 4;
                        }
                    };
                    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
                    let mut parts = head.split_whitespace();
                    let method = parts.next().unwrap_or_default().to_string();
                    let path = parts.next().unwrap_or_default().to_string();
                    let len: usize = head
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    while buf.len() < header_end + len {
                        let n = stream.read(&mut chunk).await.unwrap();
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }
                    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();
                    log.lock().unwrap().push(Recorded {
                        method,
                        path: path.clone(),
                        body,
                    });

                    let (status, payload) = reply(&path);
                    let response = format!(
                        "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        status,
                        payload.len(),
                        payload
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        log
    }

    #[tokio::test]
    async fn api_error_is_captured() {
        let tmp = tempfile::tempdir().unwrap();
        let sock = tmp.path().join("api.sock");
        serve(&sock, |_| {
            (400, r#"{"fault_message":"Cannot pause: VM not started"}"#)
        });

        let client = FirecrackerClient::new(&sock);
        match client.pause().await {
            Err(FirecrackerError::Api(e)) => {
                assert_eq!(e.status, 400);
                assert_eq!(e.path, "/vm");
                assert_eq!(e.fault_message, "Cannot pause: VM not started");
            }
            other => panic!("expected ApiError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn apply_config_submits_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let sock = tmp.path().join("api.sock");
        let log = serve(&sock, |_| (204, ""));

        let cfg = VmConfigBuilder::new("vmlinux", "rootfs.ext4", "overlay.ext4", "vsock.sock")
            .build();
        FirecrackerClient::new(&sock).apply_config(&cfg).await.unwrap();

        let log = log.lock().unwrap().clone();
        let paths: Vec<&str> = log.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "/machine-config",
                "/boot-source",
                "/drives/rootfs",
                "/drives/overlay",
                "/network-interfaces/eth0",
                "/vsock",
                "/actions",
            ]
        );
        assert!(log.iter().all(|r| r.method == "PUT"));
        assert!(log[6].body.contains("InstanceStart"));
    }

    #[tokio::test]
    async fn load_snapshot_body() {
        let tmp = tempfile::tempdir().unwrap();
        let sock = tmp.path().join("api.sock");
        let log = serve(&sock, |_| (204, ""));

        FirecrackerClient::new(&sock)
            .load_snapshot(
                Path::new("snapshot.bin"),
                &MemoryBackend::File(PathBuf::from("memory.bin")),
                true,
                &[NetworkOverride {
                    iface_id: "eth0".to_string(),
                    host_dev_name: "vmtap0".to_string(),
                }],
            )
            .await
            .unwrap();

        let log = log.lock().unwrap().clone();
        let body: Value = serde_json::from_str(&log[0].body).unwrap();
        assert_eq!(log[0].path, "/snapshot/load");
        assert_eq!(body["mem_backend"]["backend_type"], "File");
        assert_eq!(body["resume_vm"], true);
        assert_eq!(body["network_overrides"][0]["host_dev_name"], "vmtap0");
    }

    #[tokio::test]
    async fn ready_once_api_answers() {
        let tmp = tempfile::tempdir().unwrap();
        let sock = tmp.path().join("api.sock");
        serve(&sock, |_| (200, r#"{"state":"Not started"}"#));
        FirecrackerClient::new(&sock)
            .wait_for_ready(Duration::from_secs(2), Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn readiness_times_out_without_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let client = FirecrackerClient::new(tmp.path().join("missing.sock"));
        let start = Instant::now();
        let err = client
            .wait_for_ready(Duration::from_millis(50), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, FirecrackerError::NotReady { timeout_ms: 50, .. }));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn fault_message_fallback() {
        assert_eq!(fault_message(br#"{"fault_message":"boom"}"#), "boom");
        assert_eq!(fault_message(b"plain text\n"), "plain text");
    }
}
