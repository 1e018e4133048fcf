//! One live connection to a guest agent.
//!
//! A single reader task owns the read half and routes every frame: responses
//! go to the caller waiting on that request id, process exits go to whoever
//! waits on that pid. An exit that arrives before anyone waits for it is
//! buffered so it is not lost.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::GuestError;
use crate::protocol::{GuestMessage, Op, ProcessExit, Request, read_frame, write_frame};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Reply = Result<Value, GuestError>;

#[derive(Default)]
struct Routes {
    pending: HashMap<u64, oneshot::Sender<Reply>>,
    exit_waiters: HashMap<u32, oneshot::Sender<ProcessExit>>,
    early_exits: HashMap<u32, ProcessExit>,
    hello: Option<u32>,
}

pub struct Connection {
    writer: tokio::sync::Mutex<Writer>,
    routes: Arc<Mutex<Routes>>,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl Connection {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let routes = Arc::new(Mutex::new(Routes::default()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(read_half, routes.clone(), closed.clone()));
        let writer: Writer = Box::new(write_half);
        Self {
            writer: tokio::sync::Mutex::new(writer),
            routes,
            closed,
            next_id: AtomicU64::new(1),
            reader,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Protocol version announced by a guest-initiated connection.
    pub fn hello_version(&self) -> Option<u32> {
        self.routes.lock().ok().and_then(|r| r.hello)
    }

    /// Send `op` and wait up to `timeout` for its response.
    pub async fn call(&self, op: Op, timeout: Duration) -> Result<Value, GuestError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let op_name = op.name();
        let rx = {
            // Checked under the lock: the reader drains `pending` after
            // marking the connection closed.
            let mut routes = self.lock_routes()?;
            if self.is_closed() {
                return Err(GuestError::Disconnected);
            }
            let (tx, rx) = oneshot::channel();
            routes.pending.insert(id, tx);
            rx
        };

        let sent = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &Request { id, op }).await
        };
        if let Err(e) = sent {
            self.forget(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(GuestError::Disconnected),
            Err(_) => {
                self.forget(id);
                Err(GuestError::Timeout {
                    op: op_name.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Wait for the exit of a process started with `spawn`.
    pub async fn wait_exit(&self, pid: u32, timeout: Duration) -> Result<ProcessExit, GuestError> {
        let rx = {
            let mut routes = self.lock_routes()?;
            if let Some(exit) = routes.early_exits.remove(&pid) {
                return Ok(exit);
            }
            if self.is_closed() {
                return Err(GuestError::Disconnected);
            }
            let (tx, rx) = oneshot::channel();
            routes.exit_waiters.insert(pid, tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(exit)) => Ok(exit),
            Ok(Err(_)) => Err(GuestError::Disconnected),
            Err(_) => {
                if let Ok(mut routes) = self.routes.lock() {
                    routes.exit_waiters.remove(&pid);
                }
                Err(GuestError::Timeout {
                    op: format!("wait for pid {}", pid),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn lock_routes(&self) -> Result<std::sync::MutexGuard<'_, Routes>, GuestError> {
        self.routes
            .lock()
            .map_err(|_| GuestError::Protocol("routing table poisoned".into()))
    }

    fn forget(&self, id: u64) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.pending.remove(&id);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<S>(mut reader: ReadHalf<S>, routes: Arc<Mutex<Routes>>, closed: Arc<AtomicBool>)
where
    S: AsyncRead + AsyncWrite + Send,
{
    loop {
        match read_frame::<_, GuestMessage>(&mut reader).await {
            Ok(Some(msg)) => route(&routes, msg),
            Ok(None) => {
                debug!("[guest] connection closed by guest");
                break;
            }
            Err(e) => {
                warn!("[guest] read failed: {}", e);
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    if let Ok(mut routes) = routes.lock() {
        for (_, tx) in routes.pending.drain() {
            let _ = tx.send(Err(GuestError::Disconnected));
        }
        // Dropping the senders wakes exit waiters with Disconnected.
        routes.exit_waiters.clear();
    }
}

fn route(routes: &Mutex<Routes>, msg: GuestMessage) {
    let Ok(mut routes) = routes.lock() else {
        return;
    };
    match msg {
        GuestMessage::Response { id, ok, error } => {
            let Some(tx) = routes.pending.remove(&id) else {
                debug!("[guest] response for unknown request {}", id);
                return;
            };
            let reply = match error {
                Some(err) => Err(GuestError::Remote(err)),
                None => Ok(ok.unwrap_or(Value::Null)),
            };
            let _ = tx.send(reply);
        }
        GuestMessage::ProcessExit(exit) => match routes.exit_waiters.remove(&exit.pid) {
            Some(tx) => {
                let _ = tx.send(exit);
            }
            None => {
                routes.early_exits.insert(exit.pid, exit);
            }
        },
        GuestMessage::Hello { version } => {
            debug!("[guest] hello (protocol v{})", version);
            routes.hello = Some(version);
        }
    }
}
