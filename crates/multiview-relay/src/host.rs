//! Delivery into capture agent contexts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use multiview_common::{Error, Result, SessionKey, SignalEnvelope, SourceId, SubSourceId};

/// Mailbox of one attached capture agent.
pub type AgentAddress = mpsc::Sender<SignalEnvelope>;

/// Loads the capture capability into a page context that has none yet.
pub type Injector = Arc<dyn Fn(SourceId) -> Result<()> + Send + Sync>;

/// The environment that hosts capture agents.
#[async_trait]
pub trait AgentHost: Send + Sync + 'static {
    /// Delivers to one frame of `source`, or to every frame when
    /// `sub_source` is `None`. Fails if nothing received the envelope.
    async fn deliver(
        &self,
        source: SourceId,
        sub_source: Option<SubSourceId>,
        envelope: SignalEnvelope,
    ) -> Result<()>;

    async fn inject_capture(&self, source: SourceId) -> Result<()>;
}

#[derive(Debug)]
pub enum CaptureOutcome {
    /// The context already ran a capture agent.
    Delivered,
    /// Delivered after injecting the capture capability.
    Recovered,
    Failed(Error),
}

impl CaptureOutcome {
    pub fn is_delivered(&self) -> bool {
        !matches!(self, CaptureOutcome::Failed(_))
    }
}

/// Asks every frame of `source` to (re)start capturing. A context that does
/// not answer gets the capture capability injected and one more attempt
/// after `settle`.
pub async fn capture_with_recovery<H: AgentHost + ?Sized>(
    host: &H,
    source: SourceId,
    settle: Duration,
) -> CaptureOutcome {
    match host.deliver(source, None, SignalEnvelope::InitCapture).await {
        Ok(()) => return CaptureOutcome::Delivered,
        Err(err) => debug!(%source, error = %err, "capture agent not reachable, injecting"),
    }

    if let Err(err) = host.inject_capture(source).await {
        warn!(%source, error = %err, "capture injection failed");
        return CaptureOutcome::Failed(err);
    }

    tokio::time::sleep(settle).await;

    match host.deliver(source, None, SignalEnvelope::InitCapture).await {
        Ok(()) => {
            info!(%source, "capture agent started after injection");
            CaptureOutcome::Recovered
        }
        Err(err) => {
            warn!(%source, error = %err, "capture agent still unreachable after injection");
            CaptureOutcome::Failed(err)
        }
    }
}

/// In-process host: capture agents attach a mailbox per frame.
#[derive(Default)]
pub struct LocalAgentHost {
    agents: RwLock<HashMap<SessionKey, AgentAddress>>,
    injector: Option<Injector>,
}

impl LocalAgentHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_injector(injector: Injector) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            injector: Some(injector),
        }
    }

    /// Attaches the mailbox for `key`, returning the one it replaced.
    pub async fn attach(&self, key: SessionKey, address: AgentAddress) -> Option<AgentAddress> {
        self.agents.write().await.insert(key, address)
    }

    /// Detaches `key` only if it is still bound to `address`.
    pub async fn detach(&self, key: SessionKey, address: &AgentAddress) -> bool {
        let mut agents = self.agents.write().await;
        if agents.get(&key).is_some_and(|a| a.same_channel(address)) {
            agents.remove(&key);
            return true;
        }
        false
    }

    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.len()
    }
}

#[async_trait]
impl AgentHost for LocalAgentHost {
    async fn deliver(
        &self,
        source: SourceId,
        sub_source: Option<SubSourceId>,
        envelope: SignalEnvelope,
    ) -> Result<()> {
        let targets: Vec<(SessionKey, AgentAddress)> = {
            let agents = self.agents.read().await;
            match sub_source {
                Some(sub_source) => {
                    let key = SessionKey::new(source, sub_source);
                    agents
                        .get(&key)
                        .map(|address| (key, address.clone()))
                        .into_iter()
                        .collect()
                }
                None => agents
                    .iter()
                    .filter(|(key, _)| key.source == source)
                    .map(|(key, address)| (*key, address.clone()))
                    .collect(),
            }
        };

        let mut delivered = 0usize;
        let mut stale = Vec::new();
        for (key, address) in targets {
            match address.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Closed(_)) => stale.push((key, address)),
                Err(TrySendError::Full(_)) => {
                    warn!(agent = %key, kind = envelope.kind(), "agent mailbox full")
                }
            }
        }

        for (key, address) in stale {
            debug!(agent = %key, "dropping closed agent mailbox");
            self.detach(key, &address).await;
        }

        if delivered == 0 {
            return Err(Error::delivery(format!(
                "no capture agent reachable for source {source}"
            )));
        }
        Ok(())
    }

    async fn inject_capture(&self, source: SourceId) -> Result<()> {
        match &self.injector {
            Some(inject) => inject(source),
            None => Err(Error::delivery("no capture injector configured")),
        }
    }
}
