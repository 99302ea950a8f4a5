use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use multiview_common::config::RelayConfig;
use multiview_common::{Error, Result, SessionKey, SignalEnvelope, SignalSink, SourceId};

use crate::host::{capture_with_recovery, AgentHost, CaptureOutcome};

const RELAY_INBOX_CAPACITY: usize = 256;

/// Mailbox of the registered aggregator.
pub type AggregatorAddress = mpsc::Sender<SignalEnvelope>;

#[derive(Debug)]
pub enum RelayCommand {
    RegisterAggregator(AggregatorAddress),
    /// An envelope sent by the capture agent running in `origin`.
    FromAgent {
        origin: SessionKey,
        title: Option<String>,
        envelope: SignalEnvelope,
    },
    FromAggregator(SignalEnvelope),
    /// `requester`, when known, becomes the registered aggregator.
    StartCapture {
        source_ids: Vec<SourceId>,
        requester: Option<AggregatorAddress>,
    },
}

pub struct Relay<H: AgentHost> {
    host: Arc<H>,
    aggregator: Option<AggregatorAddress>,
    config: RelayConfig,
}

impl<H: AgentHost> Relay<H> {
    pub fn new(host: Arc<H>, config: RelayConfig) -> Self {
        Self {
            host,
            aggregator: None,
            config,
        }
    }

    pub fn has_aggregator(&self) -> bool {
        self.aggregator.is_some()
    }

    pub fn register_aggregator(&mut self, address: AggregatorAddress) {
        if self
            .aggregator
            .as_ref()
            .is_some_and(|current| current.same_channel(&address))
        {
            debug!("aggregator already registered");
            return;
        }
        info!(replaced = self.aggregator.is_some(), "aggregator registered");
        self.aggregator = Some(address);
    }

    /// Delivers to the registered aggregator. A closed mailbox drops the
    /// registration so later envelopes are not routed to a dead address; a
    /// full one only drops this envelope.
    pub fn route_to_aggregator(&mut self, envelope: SignalEnvelope) -> Result<()> {
        let Some(address) = &self.aggregator else {
            warn!(kind = envelope.kind(), "no aggregator registered, dropping envelope");
            return Err(Error::delivery("no aggregator registered"));
        };
        let kind = envelope.kind();
        match address.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(kind, "aggregator mailbox full, dropping envelope");
                Err(Error::delivery("aggregator mailbox full"))
            }
            Err(TrySendError::Closed(_)) => {
                warn!(kind, "aggregator gone, invalidating registration");
                self.aggregator = None;
                Err(Error::delivery("aggregator unreachable"))
            }
        }
    }

    /// Best effort; agents recover through their own liveness loop.
    pub async fn route_to_agent(&self, target: SessionKey, envelope: SignalEnvelope) {
        let kind = envelope.kind();
        if let Err(err) = self
            .host
            .deliver(target.source, Some(target.sub_source), envelope)
            .await
        {
            warn!(agent = %target, kind, error = %err, "dropping envelope for unreachable agent");
        }
    }

    /// Asks each distinct source (capped) to start capturing, recovering
    /// unresponsive contexts in the background.
    pub fn start_capture(&self, source_ids: Vec<SourceId>) -> Vec<JoinHandle<CaptureOutcome>> {
        let mut seen = HashSet::new();
        let targets: Vec<SourceId> = source_ids
            .into_iter()
            .filter(|id| seen.insert(*id))
            .take(self.config.max_capture_targets)
            .collect();
        info!(targets = ?targets, "starting capture");

        targets
            .into_iter()
            .map(|source| {
                let host = Arc::clone(&self.host);
                let settle = self.config.settle_delay;
                tokio::spawn(async move { capture_with_recovery(host.as_ref(), source, settle).await })
            })
            .collect()
    }

    pub async fn handle(&mut self, command: RelayCommand) {
        match command {
            RelayCommand::RegisterAggregator(address) => self.register_aggregator(address),
            RelayCommand::FromAgent {
                origin,
                title,
                envelope,
            } => {
                let kind = envelope.kind();
                match envelope.stamp_origin(origin, title.as_deref()) {
                    Some(envelope) => {
                        let _ = self.route_to_aggregator(envelope);
                    }
                    None => warn!(agent = %origin, kind, "unsupported envelope from agent"),
                }
            }
            RelayCommand::FromAggregator(envelope) => match envelope.agent_target() {
                Some(target) => self.route_to_agent(target, envelope).await,
                None => match envelope {
                    SignalEnvelope::StartCapture { source_ids } => {
                        self.start_capture(source_ids);
                    }
                    other => warn!(kind = other.kind(), "unsupported envelope from aggregator"),
                },
            },
            RelayCommand::StartCapture {
                source_ids,
                requester,
            } => {
                if let Some(requester) = requester {
                    self.register_aggregator(requester);
                }
                self.start_capture(source_ids);
            }
        }
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<RelayCommand>) {
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        debug!("relay inbox closed");
    }

    pub fn spawn(self) -> RelayHandle {
        let (tx, rx) = mpsc::channel(RELAY_INBOX_CAPACITY);
        tokio::spawn(self.run(rx));
        RelayHandle { tx }
    }
}

#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayCommand>,
}

impl RelayHandle {
    pub async fn send(&self, command: RelayCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::delivery("relay stopped"))
    }

    /// Outbound sink for the capture agent running in `origin`.
    pub fn agent_port(&self, origin: SessionKey, title: Option<String>) -> AgentPort {
        AgentPort {
            relay: self.clone(),
            origin,
            title,
        }
    }

    /// Outbound sink for an aggregator reachable at `address`.
    pub fn aggregator_port(&self, address: AggregatorAddress) -> AggregatorPort {
        AggregatorPort {
            relay: self.clone(),
            address,
        }
    }
}

pub struct AgentPort {
    relay: RelayHandle,
    origin: SessionKey,
    title: Option<String>,
}

#[async_trait]
impl SignalSink for AgentPort {
    async fn send(&self, envelope: SignalEnvelope) -> Result<()> {
        self.relay
            .send(RelayCommand::FromAgent {
                origin: self.origin,
                title: self.title.clone(),
                envelope,
            })
            .await
    }
}

pub struct AggregatorPort {
    relay: RelayHandle,
    address: AggregatorAddress,
}

#[async_trait]
impl SignalSink for AggregatorPort {
    async fn send(&self, envelope: SignalEnvelope) -> Result<()> {
        let command = match envelope {
            SignalEnvelope::RegisterAggregator => {
                RelayCommand::RegisterAggregator(self.address.clone())
            }
            SignalEnvelope::StartCapture { source_ids } => RelayCommand::StartCapture {
                source_ids,
                requester: Some(self.address.clone()),
            },
            other => RelayCommand::FromAggregator(other),
        };
        self.relay.send(command).await
    }
}
