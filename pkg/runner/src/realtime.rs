//! Push intake: websocket subscription to job notifications.
//!
//! Each session fetches a fresh token, connects, and forwards every
//! `{"type":"job","runId":…}` message as a `Notify`. Any failure ends the
//! session; the next one starts after a capped exponential backoff.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use pkg_constants::state::{REALTIME_BACKOFF_INITIAL_MS, REALTIME_BACKOFF_MAX_MS};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use crate::api::{ControlPlane, RealtimeToken};
use crate::scheduler::RunnerEvent;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    run_id: Option<String>,
}

/// Run id of a job notification; `None` for anything else.
pub fn parse_message(text: &str) -> Option<String> {
    let msg: PushMessage = serde_json::from_str(text).ok()?;
    if msg.kind != "job" {
        return None;
    }
    msg.run_id.filter(|id| !id.is_empty())
}

/// Capped exponential backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(REALTIME_BACKOFF_INITIAL_MS),
            Duration::from_millis(REALTIME_BACKOFF_MAX_MS),
        )
    }
}

/// The socket URL with `token` appended as a form-encoded query pair.
fn socket_url(token: &RealtimeToken) -> Result<String> {
    let mut url = reqwest::Url::parse(&token.url)
        .with_context(|| format!("invalid realtime url {}", token.url))?;
    url.query_pairs_mut().append_pair("token", &token.token);
    Ok(url.into())
}

pub struct RealtimeSubscriber {
    control: Arc<dyn ControlPlane>,
    tx: mpsc::UnboundedSender<RunnerEvent>,
    backoff: Backoff,
}

impl RealtimeSubscriber {
    pub fn new(control: Arc<dyn ControlPlane>, tx: mpsc::UnboundedSender<RunnerEvent>) -> Self {
        Self {
            control,
            tx,
            backoff: Backoff::default(),
        }
    }

    /// Keep a subscription open until the scheduler goes away.
    pub async fn run(mut self) {
        while !self.tx.is_closed() {
            if let Err(e) = self.session().await {
                warn!("[realtime] subscription lost: {:#}", e);
            }
            if self.tx.is_closed() {
                break;
            }
            let delay = self.backoff.next_delay();
            debug!("[realtime] reconnecting in {}ms", delay.as_millis());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.tx.closed() => break,
            }
        }
        debug!("[realtime] stopped");
    }

    async fn session(&mut self) -> Result<()> {
        let token = self.control.realtime_token().await?;
        let (stream, _) = connect_async(socket_url(&token)?)
            .await
            .with_context(|| format!("connect {}", token.url))?;
        info!("[realtime] connected to {}", token.url);
        self.backoff.reset();

        let (_write, mut read) = stream.split();
        loop {
            let msg = tokio::select! {
                msg = read.next() => msg,
                _ = self.tx.closed() => return Ok(()),
            };
            match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    let Some(run_id) = parse_message(text.as_str()) else {
                        debug!("[realtime] ignoring message: {}", text.as_str());
                        continue;
                    };
                    debug!(run_id = %run_id, "[realtime] job available");
                    if self.tx.send(RunnerEvent::Notify(run_id)).is_err() {
                        return Ok(());
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    anyhow::bail!("closed by server: {:?}", frame);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("read websocket"),
                None => anyhow::bail!("stream ended"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_job_messages_only() {
        assert_eq!(
            parse_message(r#"{"type":"job","runId":"r-1"}"#),
            Some("r-1".to_string())
        );
        assert_eq!(parse_message(r#"{"type":"ping"}"#), None);
        assert_eq!(parse_message(r#"{"type":"job"}"#), None);
        assert_eq!(parse_message(r#"{"type":"job","runId":""}"#), None);
        assert_eq!(parse_message("not json"), None);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn token_is_appended_to_url() {
        let t = RealtimeToken {
            url: "wss://rt.example.com/ws".into(),
            token: "abc".into(),
        };
        assert_eq!(socket_url(&t).unwrap(), "wss://rt.example.com/ws?token=abc");
        let t = RealtimeToken {
            url: "wss://rt.example.com/ws?v=1".into(),
            token: "abc".into(),
        };
        assert_eq!(socket_url(&t).unwrap(), "wss://rt.example.com/ws?v=1&token=abc");
    }

    #[test]
    fn token_is_url_encoded() {
        let t = RealtimeToken {
            url: "wss://rt.example.com/ws".into(),
            token: "a+b/c=&d e".into(),
        };
        assert_eq!(
            socket_url(&t).unwrap(),
            "wss://rt.example.com/ws?token=a%2Bb%2Fc%3D%26d+e"
        );
        let bad = RealtimeToken {
            url: "not a url".into(),
            token: "t".into(),
        };
        assert!(socket_url(&bad).is_err());
    }
}
