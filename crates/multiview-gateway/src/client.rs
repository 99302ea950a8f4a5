//! Client side of the `/ws` endpoint, for agents and aggregators running
//! out of process.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use multiview_common::{Error, Result, SignalEnvelope, SignalSink};

const LINK_OUTBOX_CAPACITY: usize = 128;

/// Outbound half of a gateway connection. Envelopes received from the
/// gateway are pushed into the inbox given to [`GatewayLink::connect`].
#[derive(Clone)]
pub struct GatewayLink {
    outbox: mpsc::Sender<SignalEnvelope>,
}

impl GatewayLink {
    pub async fn connect(url: &str, inbox: mpsc::Sender<SignalEnvelope>) -> Result<Self> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| Error::transport(format!("connect {url}: {e}")))?;
        let (mut sink, mut stream) = ws.split();
        let (outbox, mut outgoing) = mpsc::channel::<SignalEnvelope>(LINK_OUTBOX_CAPACITY);

        tokio::spawn(async move {
            while let Some(envelope) = outgoing.recv().await {
                let text = match envelope.to_json() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "dropping unencodable envelope");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match SignalEnvelope::from_json(&text) {
                    Ok(envelope) => {
                        if inbox.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "invalid envelope from gateway"),
                }
            }
            debug!("gateway connection closed");
        });

        Ok(Self { outbox })
    }
}

#[async_trait]
impl SignalSink for GatewayLink {
    async fn send(&self, envelope: SignalEnvelope) -> Result<()> {
        self.outbox
            .send(envelope)
            .await
            .map_err(|_| Error::delivery("gateway connection closed"))
    }
}
