use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::SignalEnvelope;

/// Where a component sends its outbound signaling envelopes.
///
/// Capture agents and the aggregator only ever talk to the relay through
/// this seam; the relay decides which delivery address an envelope reaches.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send(&self, envelope: SignalEnvelope) -> Result<()>;
}
