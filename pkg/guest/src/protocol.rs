//! Wire format: `u32` big-endian length, then that many bytes of JSON.

use pkg_constants::vm::MAX_FRAME_BYTES;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::GuestError;

/// Host → guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub op: Op,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Ping,
    Exec {
        command: String,
        timeout_ms: u64,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Spawn {
        command: String,
        timeout_ms: u64,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    WriteFile {
        path: String,
        /// base64
        content: String,
        #[serde(default)]
        mode: Option<u32>,
        #[serde(default)]
        sudo: bool,
    },
    ReadFile {
        path: String,
    },
    Mkdir {
        path: String,
        #[serde(default)]
        sudo: bool,
    },
    Exists {
        path: String,
    },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Ping => "ping",
            Op::Exec { .. } => "exec",
            Op::Spawn { .. } => "spawn",
            Op::WriteFile { .. } => "write_file",
            Op::ReadFile { .. } => "read_file",
            Op::Mkdir { .. } => "mkdir",
            Op::Exists { .. } => "exists",
        }
    }
}

/// Guest → host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuestMessage {
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ok: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Unsolicited: a spawned process finished.
    ProcessExit(ProcessExit),
    /// Sent once by the guest when it initiates the connection.
    Hello { version: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    pub pid: u32,
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// `read_file` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContent {
    pub content: String,
}

/// `exists` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistsReply {
    pub exists: bool,
}

pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), GuestError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let body = serde_json::to_vec(msg).map_err(|e| GuestError::Protocol(e.to_string()))?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(GuestError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    let len = body.len() as u32;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    writer
        .write_all(&frame)
        .await
        .map_err(|_| GuestError::Disconnected)?;
    writer.flush().await.map_err(|_| GuestError::Disconnected)
}

/// Next frame, or `None` on a clean EOF between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, GuestError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(_) => return Err(GuestError::Disconnected),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(GuestError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|_| GuestError::Disconnected)?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| GuestError::Protocol(format!("invalid frame: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_shape() {
        let req = Request {
            id: 7,
            op: Op::Exec {
                command: "ls".into(),
                timeout_ms: 1000,
                env: HashMap::new(),
            },
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["id"], 7);
        assert_eq!(v["op"], "exec");
        assert_eq!(v["command"], "ls");
    }

    #[test]
    fn guest_messages_parse() {
        let m: GuestMessage =
            serde_json::from_value(json!({"type": "response", "id": 1, "ok": {"pid": 5}})).unwrap();
        assert!(matches!(m, GuestMessage::Response { id: 1, ok: Some(_), error: None }));

        let m: GuestMessage = serde_json::from_value(
            json!({"type": "process_exit", "pid": 5, "exit_code": 2, "stdout": "x"}),
        )
        .unwrap();
        assert_eq!(
            m,
            GuestMessage::ProcessExit(ProcessExit {
                pid: 5,
                exit_code: 2,
                stdout: "x".into(),
                stderr: String::new(),
            })
        );

        let m: GuestMessage = serde_json::from_value(json!({"type": "hello", "version": 1})).unwrap();
        assert_eq!(m, GuestMessage::Hello { version: 1 });
    }

    #[tokio::test]
    async fn frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &GuestMessage::Hello { version: 1 })
            .await
            .unwrap();
        drop(a);
        let got: Option<GuestMessage> = read_frame(&mut b).await.unwrap();
        assert_eq!(got, Some(GuestMessage::Hello { version: 1 }));
        let eof: Option<GuestMessage> = read_frame(&mut b).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME_BYTES as u32 + 1).to_be_bytes();
        a.write_all(&len).await.unwrap();
        let err = read_frame::<_, GuestMessage>(&mut b).await.unwrap_err();
        assert!(matches!(err, GuestError::Protocol(_)));
    }
}
