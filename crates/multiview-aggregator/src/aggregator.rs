//! Aggregator actor.
//!
//! Owns the inbound session table, the per-source arbitration table and the
//! exposed streams. Every mutation happens inside one of the `on_*` handlers
//! driven by [`Aggregator::run`], so there is no locking; transport callbacks
//! arrive as tagged notices and are checked against the session table before
//! they touch anything.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use multiview_common::config::AggregatorConfig;
use multiview_common::{
    Error, IceCandidate, QualityScore, Result, SessionDescription, SessionKey, SignalEnvelope,
    SignalSink, SourceId, SubSourceId,
};
use multiview_transport::{
    PeerConnector, PeerSession, RemoteTrack, SessionEvent, SessionNotice, SessionState,
    SessionTable, SessionTag,
};

use crate::arbitration::{ActiveSource, Arbitration, ArbitrationTable};
use crate::presentation::{ExposedStream, PresentationSink};
use crate::selection::{self, SelectionStore};

const AGGREGATOR_INBOX_CAPACITY: usize = 256;

/// Creates the mailbox the relay delivers aggregator-bound envelopes to.
pub fn mailbox() -> (mpsc::Sender<SignalEnvelope>, mpsc::Receiver<SignalEnvelope>) {
    mpsc::channel(AGGREGATOR_INBOX_CAPACITY)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Accepted { displaced: Option<SubSourceId> },
    /// A selection is in effect and the source is not in it.
    NotSelected,
    Outranked { incumbent: ActiveSource },
    /// Accepted, but the description could not be negotiated.
    NegotiationFailed,
}

pub struct Aggregator<C: PeerConnector> {
    connector: C,
    relay: Arc<dyn SignalSink>,
    selection: Arc<dyn SelectionStore>,
    sink: Arc<dyn PresentationSink>,
    config: AggregatorConfig,
    arbitration: ArbitrationTable,
    sessions: SessionTable<C::Session>,
    exposed: BTreeMap<SourceId, ExposedStream>,
    titles: HashMap<SourceId, String>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    notices_rx: Option<mpsc::UnboundedReceiver<SessionNotice>>,
}

impl<C: PeerConnector> Aggregator<C> {
    pub fn new(
        connector: C,
        relay: Arc<dyn SignalSink>,
        selection: Arc<dyn SelectionStore>,
        sink: Arc<dyn PresentationSink>,
        config: AggregatorConfig,
    ) -> Self {
        let (notices, notices_rx) = mpsc::unbounded_channel();
        Self {
            connector,
            relay,
            selection,
            sink,
            config,
            arbitration: ArbitrationTable::new(),
            sessions: SessionTable::new(),
            exposed: BTreeMap::new(),
            titles: HashMap::new(),
            notices,
            notices_rx: Some(notices_rx),
        }
    }

    pub fn active(&self, source: SourceId) -> Option<ActiveSource> {
        self.arbitration.get(source)
    }

    pub fn exposed(&self, source: SourceId) -> Option<&ExposedStream> {
        self.exposed.get(&source)
    }

    pub fn exposed_sources(&self) -> Vec<SourceId> {
        self.exposed.keys().copied().collect()
    }

    pub fn session_state(&self, key: SessionKey) -> Option<SessionState> {
        self.sessions.state(key)
    }

    pub fn current_session(&self, key: SessionKey) -> Option<SessionTag> {
        self.sessions.current(key)
    }

    pub async fn register_self(&self) -> Result<()> {
        self.relay.send(SignalEnvelope::RegisterAggregator).await
    }

    /// The current selection; a store that cannot be read acts as no filter.
    async fn load_selection(&self) -> Vec<SourceId> {
        match self.selection.load().await {
            Ok(selection) => selection,
            Err(err) => {
                warn!(error = %err, "selection unavailable, not filtering");
                Vec::new()
            }
        }
    }

    /// Exposed sources in display order.
    pub async fn visible_order(&self) -> Vec<SourceId> {
        let selection = self.load_selection().await;
        selection::visible_order(&selection, self.exposed.keys().copied())
    }

    fn unexpose(&mut self, key: SessionKey) {
        if self
            .exposed
            .get(&key.source)
            .is_some_and(|stream| stream.sub_source == key.sub_source)
        {
            self.exposed.remove(&key.source);
            self.sink.remove(key.source);
        }
    }

    pub async fn on_offer(
        &mut self,
        key: SessionKey,
        description: SessionDescription,
        score: QualityScore,
        title: Option<String>,
    ) -> OfferOutcome {
        let selection = self.load_selection().await;
        if !selection.is_empty() && !selection.contains(&key.source) {
            debug!(session = %key, "offer for unselected source, ignoring");
            self.sessions.discard_pending(key);
            return OfferOutcome::NotSelected;
        }

        let displaced = match self.arbitration.arbitrate(key, score) {
            Arbitration::Reject { incumbent } => {
                info!(
                    session = %key,
                    %score,
                    incumbent_sub_source = %incumbent.sub_source,
                    incumbent_score = %incumbent.score,
                    "offer outranked"
                );
                self.sessions.discard_pending(key);
                return OfferOutcome::Outranked { incumbent };
            }
            Arbitration::Accept { displaced } => displaced,
        };

        if let Some(previous) = displaced {
            let previous = SessionKey::new(key.source, previous);
            info!(session = %key, displaced = %previous, %score, "sub-source takes over");
            self.sessions.teardown(previous).await;
            self.unexpose(previous);
        }
        self.arbitration.commit(key, score);
        if let Some(title) = title {
            self.titles.insert(key.source, title);
        }

        if let Some(old) = self.sessions.teardown(key).await {
            debug!(session = %key, generation = old.generation, "re-offer supersedes session");
        }

        match self.answer(key, description).await {
            Ok(()) => OfferOutcome::Accepted { displaced },
            Err(err) => {
                warn!(session = %key, error = %err, "failed to answer offer");
                OfferOutcome::NegotiationFailed
            }
        }
    }

    async fn answer(&mut self, key: SessionKey, description: SessionDescription) -> Result<()> {
        let tag = self.sessions.allocate(key);
        let session = self.connector.open(tag, self.notices.clone()).await?;
        self.sessions.insert(tag, session)?;

        let drained = self.sessions.apply_remote_description(key, description).await?;
        let answer = {
            let session = self
                .sessions
                .session(key)
                .ok_or_else(|| Error::internal("session vanished during answer"))?;
            let answer = session.create_answer().await?;
            session.set_local_description(answer.clone()).await?;
            answer
        };

        info!(
            session = %key,
            generation = tag.generation,
            queued_candidates = drained,
            "sending answer"
        );
        self.relay
            .send(SignalEnvelope::Answer {
                target_source_id: key.source,
                target_sub_source_id: key.sub_source,
                sdp: answer,
            })
            .await
    }

    pub async fn on_remote_candidate(&mut self, key: SessionKey, candidate: IceCandidate) {
        if !self.arbitration.admits(key) {
            debug!(session = %key, "candidate from non-winning sub-source, dropping");
            return;
        }
        if self.sessions.current(key).is_none() {
            let selection = self.load_selection().await;
            if !selection.is_empty() && !selection.contains(&key.source) {
                debug!(session = %key, "candidate for unselected source, dropping");
                return;
            }
        }
        let disposition = self.sessions.add_remote_candidate(key, candidate).await;
        debug!(session = %key, ?disposition, "remote candidate");
    }

    pub async fn on_signal(&mut self, envelope: SignalEnvelope) {
        match envelope {
            SignalEnvelope::Offer {
                source_id,
                sub_source_id,
                sdp,
                score,
                title,
            } => {
                self.on_offer(SessionKey::new(source_id, sub_source_id), sdp, score, title)
                    .await;
            }
            SignalEnvelope::Candidate {
                source_id,
                sub_source_id,
                candidate,
            } => {
                self.on_remote_candidate(SessionKey::new(source_id, sub_source_id), candidate)
                    .await
            }
            SignalEnvelope::Error { message } => warn!(%message, "relay reported an error"),
            other => debug!(kind = other.kind(), "ignoring envelope"),
        }
    }

    pub async fn on_session_notice(&mut self, notice: SessionNotice) {
        let SessionNotice { tag, event } = notice;
        if !self.sessions.is_current(&tag) {
            debug!(session = %tag.key, generation = tag.generation, "stale session event");
            return;
        }
        match event {
            SessionEvent::LocalCandidate(candidate) => {
                let envelope = SignalEnvelope::CandidateFromAggregator {
                    target_source_id: tag.key.source,
                    target_sub_source_id: tag.key.sub_source,
                    candidate,
                };
                if let Err(err) = self.relay.send(envelope).await {
                    warn!(session = %tag.key, error = %err, "failed to send local candidate");
                }
            }
            SessionEvent::Connectivity(state) if state.is_terminal() => {
                info!(session = %tag.key, ?state, "session ended");
                self.sessions.teardown(tag.key).await;
                if self.arbitration.clear_if_winner(tag.key) {
                    self.unexpose(tag.key);
                }
            }
            SessionEvent::Connectivity(state) => {
                debug!(session = %tag.key, ?state, "connectivity")
            }
            SessionEvent::Track(track) => self.on_track(tag, track),
        }
    }

    fn on_track(&mut self, tag: SessionTag, track: RemoteTrack) {
        let key = tag.key;
        if !self.arbitration.is_winner(key) {
            debug!(session = %key, track = %track.id, "track from non-winning sub-source");
            return;
        }
        if !self.exposed.contains_key(&key.source) && self.exposed.len() >= self.config.max_streams
        {
            warn!(
                session = %key,
                limit = self.config.max_streams,
                "stream limit reached, not exposing"
            );
            return;
        }

        let title = self.titles.get(&key.source).cloned();
        let stream = self
            .exposed
            .entry(key.source)
            .and_modify(|stream| {
                if stream.sub_source == key.sub_source && stream.generation == tag.generation {
                    if !stream.tracks.iter().any(|t| t.id == track.id) {
                        stream.tracks.push(track.clone());
                    }
                } else {
                    stream.sub_source = key.sub_source;
                    stream.generation = tag.generation;
                    stream.stream_id = track.stream_id.clone();
                    stream.tracks = vec![track.clone()];
                }
                stream.title = title.clone();
            })
            .or_insert_with(|| ExposedStream {
                sub_source: key.sub_source,
                generation: tag.generation,
                title,
                stream_id: track.stream_id.clone(),
                tracks: vec![track],
            });
        debug!(
            session = %key,
            generation = tag.generation,
            tracks = stream.tracks.len(),
            "exposing stream"
        );
        self.sink.upsert(key.source, stream);
    }

    /// One recovery cycle: re-register, then ask the relay to start capture
    /// for every selected source without a live stream. Returns the sources
    /// requested.
    pub async fn reconcile(&mut self) -> Vec<SourceId> {
        if let Err(err) = self.register_self().await {
            warn!(error = %err, "failed to register with relay");
        }
        let selection = self.load_selection().await;
        let missing = selection::missing_sources(&selection, |id| self.exposed.contains_key(&id));
        if missing.is_empty() {
            return missing;
        }
        info!(sources = ?missing, "requesting capture for missing sources");
        if let Err(err) = self
            .relay
            .send(SignalEnvelope::StartCapture {
                source_ids: missing.clone(),
            })
            .await
        {
            warn!(error = %err, "failed to request capture");
        }
        missing
    }

    pub async fn run(
        mut self,
        mut signals: mpsc::Receiver<SignalEnvelope>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let Some(mut notices) = self.notices_rx.take() else {
            warn!("aggregator already running");
            return;
        };
        if let Err(err) = self.register_self().await {
            warn!(error = %err, "failed to register with relay");
        }

        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                signal = signals.recv() => match signal {
                    Some(envelope) => self.on_signal(envelope).await,
                    None => break,
                },
                Some(notice) = notices.recv() => self.on_session_notice(notice).await,
                _ = ticker.tick() => {
                    self.reconcile().await;
                }
            }
        }

        self.sessions.teardown_all().await;
        info!("aggregator stopped");
    }

    pub fn spawn(self, signals: mpsc::Receiver<SignalEnvelope>) -> AggregatorHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(signals, shutdown_rx));
        AggregatorHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

pub struct AggregatorHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl AggregatorHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the aggregator and closes every inbound session.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}
