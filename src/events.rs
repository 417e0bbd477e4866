//! Event channel: the persistent websocket connection that carries RPC
//! envelopes (priority uploads/downloads, ACL manifests, deletes) between
//! this client and the server (§6.1 `EventsConnect`/`Events.Get`/`Send`).
//!
//! Reconnects with backoff when dropped; decoded messages are broadcast to
//! every subscriber so the priority handler and the ACL staging hookup can
//! each take what they need from the same stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use url::Url;
use uuid::Uuid;

use crate::wsproto::{self, Decoded};

const RECONNECT_BACKOFF_STEPS: [Duration; 5] = [
    Duration::from_millis(200),
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(10),
];
const BROADCAST_CAPACITY: usize = 1024;

/// Pending `SendWithAck` calls keyed by the message id they're waiting on.
type PendingAcks = Arc<Mutex<HashMap<String, oneshot::Sender<Result<(), String>>>>>;

#[derive(Clone)]
pub struct Events {
    url: Url,
    token: Option<String>,
    sender: broadcast::Sender<Arc<Decoded>>,
    outbound: tokio::sync::mpsc::UnboundedSender<WsMessage>,
    pending_acks: PendingAcks,
}

pub struct EventsOutbound(tokio::sync::mpsc::UnboundedReceiver<WsMessage>);

impl Events {
    /// Builds the event-channel client for `base` (the API's HTTP base url;
    /// the `ws`/`wss` scheme and `/api/v1/events` path are derived from it).
    pub fn new(base: &str, token: Option<String>) -> Result<(Self, EventsOutbound)> {
        let mut ws = Url::parse(base).context("parse event channel base url")?;
        let scheme = if ws.scheme() == "https" { "wss" } else { "ws" };
        ws.set_scheme(scheme)
            .map_err(|_| anyhow::anyhow!("set ws scheme"))?;
        ws.set_path("/api/v1/events");

        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (outbound_tx, outbound_rx) = tokio::sync::mpsc::unbounded_channel();
        Ok((
            Self {
                url: ws,
                token,
                sender,
                outbound: outbound_tx,
                pending_acks: Arc::new(Mutex::new(HashMap::new())),
            },
            EventsOutbound(outbound_rx),
        ))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Decoded>> {
        self.sender.subscribe()
    }

    /// Runs the reconnecting client loop until `shutdown` fires.
    pub async fn run(&self, mut outbound: EventsOutbound, shutdown: Arc<tokio::sync::Notify>) {
        let mut attempt = 0usize;
        loop {
            tokio::select! {
                _ = shutdown.notified() => return,
                result = self.connect_once(&mut outbound.0) => {
                    if let Err(err) = result {
                        crate::logging::error(format!("event channel disconnected: {err:#}"));
                    }
                }
            }
            let backoff = RECONNECT_BACKOFF_STEPS[attempt.min(RECONNECT_BACKOFF_STEPS.len() - 1)];
            attempt += 1;
            tokio::select! {
                _ = shutdown.notified() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    async fn connect_once(&self, outbound_rx: &mut tokio::sync::mpsc::UnboundedReceiver<WsMessage>) -> Result<()> {
        let mut request = self.url.as_str().into_client_request().context("build ws request")?;
        if let Some(token) = &self.token {
            let header_value = format!("Bearer {token}").parse().context("auth header")?;
            request.headers_mut().insert(reqwest::header::AUTHORIZATION, header_value);
        }

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .context("connect event channel")?;
        let (mut write, mut read) = stream.split();

        loop {
            tokio::select! {
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(msg) => write.send(msg).await.context("send ws frame")?,
                        None => return Ok(()),
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Binary(bytes))) => self.dispatch(wsproto::decode_binary(&bytes)),
                        Some(Ok(WsMessage::Text(text))) => self.dispatch(wsproto::decode_text_json(&text)),
                        Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(err).context("read ws frame"),
                    }
                }
            }
        }
    }

    fn dispatch(&self, decoded: Result<Decoded>) {
        let decoded = match decoded {
            Ok(d) => d,
            Err(err) => {
                crate::logging::error(format!("failed to decode event channel message: {err:#}"));
                return;
            }
        };

        if let Decoded::Ack(ack) = &decoded {
            if let Some(waiter) = self.pending_acks.lock().unwrap().remove(&ack.original_id) {
                let _ = waiter.send(Ok(()));
                return;
            }
        }
        if let Decoded::Nack(nack) = &decoded {
            if let Some(waiter) = self.pending_acks.lock().unwrap().remove(&nack.original_id) {
                let _ = waiter.send(Err(nack.error.clone()));
                return;
            }
        }

        let _ = self.sender.send(Arc::new(decoded));
    }

    /// Sends a pre-encoded frame without waiting for an ack.
    pub fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.outbound
            .send(WsMessage::Binary(frame))
            .map_err(|_| anyhow::anyhow!("event channel outbound closed"))
    }

    /// Sends a frame and waits up to `timeout` for the matching Ack/Nack
    /// (§4.6 step 4). A timeout surfaces as a transient-transport error
    /// per §7's ACK/NACK policy.
    pub async fn send_with_ack(&self, id: &str, frame: Vec<u8>, timeout: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().unwrap().insert(id.to_string(), tx);
        if let Err(err) = self.send(frame) {
            self.pending_acks.lock().unwrap().remove(id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(nack_err))) => anyhow::bail!("nack: {nack_err}"),
            Ok(Err(_)) => anyhow::bail!("event channel closed while waiting for ack"),
            Err(_) => {
                self.pending_acks.lock().unwrap().remove(id);
                anyhow::bail!("timed out waiting for ack")
            }
        }
    }

    pub fn new_message_id() -> String {
        Uuid::new_v4().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_id_is_unique() {
        let a = Events::new_message_id();
        let b = Events::new_message_id();
        assert_ne!(a, b);
    }

    #[test]
    fn base_url_is_rewritten_to_ws_scheme_and_events_path() {
        let (events, _rx) = Events::new("https://syftbox.net", None).unwrap();
        assert_eq!(events.url.scheme(), "wss");
        assert_eq!(events.url.path(), "/api/v1/events");
    }
}
