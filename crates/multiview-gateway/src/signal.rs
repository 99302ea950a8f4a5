use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use multiview_common::{SessionKey, SignalEnvelope};
use multiview_relay::{LocalAgentHost, RelayCommand, RelayHandle};

const WS_OUTBOX_CAPACITY: usize = 128;
const WS_MAX_TEXT_BYTES: usize = 64 * 1024;
const MAX_SIGNAL_SDP_BYTES: usize = 32 * 1024;
const MAX_SIGNAL_CANDIDATE_BYTES: usize = 4096;
const MAX_TITLE_BYTES: usize = 512;
const WS_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Live WebSocket connections.
#[derive(Clone, Default)]
pub struct ConnectionCounter(Arc<AtomicUsize>);

impl ConnectionCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

fn ws_connection_limit() -> usize {
    std::env::var("MULTIVIEW_WS_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(1024)
}

/// What the peer on the other end of a connection has declared itself to be.
enum Role {
    Unbound,
    Agent {
        key: SessionKey,
        title: Option<String>,
    },
    Aggregator,
}

fn error(message: impl Into<String>) -> SignalEnvelope {
    SignalEnvelope::Error {
        message: message.into(),
    }
}

async fn send_signal(tx: &mpsc::Sender<SignalEnvelope>, signal: SignalEnvelope) -> bool {
    tx.send(signal).await.is_ok()
}

/// Encodes and writes one envelope. `false` once the socket is gone.
async fn write_envelope(
    sender: &mut SplitSink<WebSocket, Message>,
    conn_id: Uuid,
    envelope: SignalEnvelope,
) -> bool {
    match envelope.to_json() {
        Ok(json) => sender.send(Message::Text(json)).await.is_ok(),
        Err(err) => {
            warn!(%conn_id, error = %err, "dropping unencodable envelope");
            true
        }
    }
}

/// Size limits on negotiation payloads.
fn payload_ok(envelope: &SignalEnvelope) -> bool {
    match envelope {
        SignalEnvelope::Offer { sdp, title, .. } => {
            sdp.sdp.len() <= MAX_SIGNAL_SDP_BYTES
                && title.as_ref().map_or(true, |t| t.len() <= MAX_TITLE_BYTES)
        }
        SignalEnvelope::Answer { sdp, .. } => sdp.sdp.len() <= MAX_SIGNAL_SDP_BYTES,
        SignalEnvelope::Candidate { candidate, .. }
        | SignalEnvelope::CandidateFromAggregator { candidate, .. } => {
            candidate.candidate.len() <= MAX_SIGNAL_CANDIDATE_BYTES
        }
        SignalEnvelope::BindAgent { title, .. } => {
            title.as_ref().map_or(true, |t| t.len() <= MAX_TITLE_BYTES)
        }
        _ => true,
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(relay): State<RelayHandle>,
    State(host): State<Arc<LocalAgentHost>>,
    State(connections): State<ConnectionCounter>,
) -> impl IntoResponse {
    if connections.get() >= ws_connection_limit() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.max_message_size(WS_MAX_TEXT_BYTES)
        .max_frame_size(WS_MAX_TEXT_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, relay, host, connections))
        .into_response()
}

async fn handle_socket(
    stream: WebSocket,
    relay: RelayHandle,
    host: Arc<LocalAgentHost>,
    connections: ConnectionCounter,
) {
    connections.0.fetch_add(1, Ordering::Relaxed);
    let conn_id = Uuid::new_v4();
    info!(%conn_id, "signaling connection opened");

    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::channel::<SignalEnvelope>(WS_OUTBOX_CAPACITY);
    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);
    let (close_tx, mut close_rx) = oneshot::channel::<()>();

    let mut writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                envelope = rx.recv() => match envelope {
                    Some(envelope) => {
                        if !write_envelope(&mut sender, conn_id, envelope).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut close_rx => {
                    // Refuse new envelopes, flush the queued ones, then close.
                    rx.close();
                    while let Some(envelope) = rx.recv().await {
                        if !write_envelope(&mut sender, conn_id, envelope).await {
                            break;
                        }
                    }
                    let _ = sender.close().await;
                    break;
                }
            }
        }
        let _ = disconnect_tx.try_send(());
    });

    let mut role = Role::Unbound;

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => break,
            msg = receiver.next() => {
                let Some(Ok(msg)) = msg else { break; };

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Binary(_) => {
                        let _ = send_signal(&tx, error("Binary messages are not supported")).await;
                        break;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                if text.len() > WS_MAX_TEXT_BYTES {
                    let _ = send_signal(&tx, error("Message too large")).await;
                    break;
                }

                let envelope = match SignalEnvelope::from_json(&text) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(%conn_id, error = %err, "invalid envelope");
                        let _ = send_signal(&tx, error("Invalid JSON")).await;
                        continue;
                    }
                };

                if !payload_ok(&envelope) {
                    let _ = send_signal(&tx, error(format!("Invalid {} payload", envelope.kind()))).await;
                    continue;
                }

                let command = match envelope {
                    SignalEnvelope::BindAgent { source_id, sub_source_id, title } => {
                        if matches!(role, Role::Aggregator) {
                            let _ = send_signal(&tx, error("Connection is registered as the aggregator")).await;
                            continue;
                        }
                        let key = SessionKey::new(source_id, sub_source_id);
                        if let Role::Agent { key: previous, .. } = &role {
                            if *previous != key {
                                host.detach(*previous, &tx).await;
                            }
                        }
                        if let Some(previous) = host.attach(key, tx.clone()).await {
                            if !previous.same_channel(&tx) {
                                let _ = previous.try_send(error("Replaced by a newer connection"));
                            }
                        }
                        info!(%conn_id, agent = %key, "agent bound");
                        role = Role::Agent { key, title };
                        continue;
                    }
                    SignalEnvelope::RegisterAggregator => {
                        if matches!(role, Role::Agent { .. }) {
                            let _ = send_signal(&tx, error("Connection is bound to an agent")).await;
                            continue;
                        }
                        role = Role::Aggregator;
                        RelayCommand::RegisterAggregator(tx.clone())
                    }
                    envelope @ (SignalEnvelope::Offer { .. } | SignalEnvelope::Candidate { .. }) => {
                        let Role::Agent { key, title } = &role else {
                            let _ = send_signal(&tx, error("BIND_AGENT required before signaling")).await;
                            break;
                        };
                        RelayCommand::FromAgent {
                            origin: *key,
                            title: title.clone(),
                            envelope,
                        }
                    }
                    envelope @ (SignalEnvelope::Answer { .. }
                    | SignalEnvelope::CandidateFromAggregator { .. }) => {
                        if !matches!(role, Role::Aggregator) {
                            let _ = send_signal(&tx, error("REGISTER_AGGREGATOR required before answering")).await;
                            continue;
                        }
                        RelayCommand::FromAggregator(envelope)
                    }
                    SignalEnvelope::StartCapture { source_ids } => RelayCommand::StartCapture {
                        source_ids,
                        requester: matches!(role, Role::Aggregator).then(|| tx.clone()),
                    },
                    SignalEnvelope::InitCapture | SignalEnvelope::Error { .. } => {
                        let _ = send_signal(&tx, error("Unsupported client message type")).await;
                        continue;
                    }
                };

                if relay.send(command).await.is_err() {
                    let _ = send_signal(&tx, error("Relay unavailable")).await;
                    break;
                }
            }
        }
    }

    if let Role::Agent { key, .. } = role {
        if host.detach(key, &tx).await {
            debug!(%conn_id, agent = %key, "agent detached");
        }
    }
    // Closing the outbox lets the relay notice a dead aggregator.
    drop(tx);
    let _ = close_tx.send(());
    if tokio::time::timeout(WS_FLUSH_TIMEOUT, &mut writer).await.is_err() {
        debug!(%conn_id, "outbox flush timed out");
        writer.abort();
    }
    connections.0.fetch_sub(1, Ordering::Relaxed);
    info!(%conn_id, "signaling connection closed");
}
