//! Capture agent state machine.
//!
//! `Idle -> Starting -> Offering -> Connected`, back to `Idle` on any restart
//! trigger. A re-init request starts over at once; a lost connection or ended
//! track starts over after the track-retry delay, and gives up once the retry
//! budget is spent without an answer being applied. All timers are scheduled
//! through `tokio::time` and stamped with the start epoch that armed them, so
//! a timer outliving its attempt is recognised and dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use multiview_common::config::CaptureConfig;
use multiview_common::{
    Error, IceCandidate, Result, SessionDescription, SessionKey, SignalEnvelope, SignalSink,
};
use multiview_transport::{
    PeerConnector, PeerSession, SessionEvent, SessionNotice, SessionState, SessionTable,
    SessionTag,
};

use crate::producer::{CapturedMedia, MediaProducer};

const AGENT_INBOX_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Idle,
    /// Looking for media.
    Starting,
    /// Offer sent, waiting for the answer.
    Offering,
    /// Answer applied.
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStatus {
    pub phase: AgentPhase,
    pub sessions_opened: u64,
    pub last_failure: Option<String>,
}

#[derive(Debug)]
enum Wakeup {
    Discover { epoch: u64 },
    RetryTracks { epoch: u64 },
    Restart { epoch: u64 },
    TrackEnded(SessionTag),
}

pub struct CaptureAgent<C: PeerConnector, P: MediaProducer> {
    key: SessionKey,
    connector: C,
    producer: P,
    relay: Arc<dyn SignalSink>,
    config: CaptureConfig,
    phase: AgentPhase,
    sessions: SessionTable<C::Session>,
    attempts: u32,
    track_retries: u32,
    restarts: u32,
    epoch: u64,
    watchers: Vec<JoinHandle<()>>,
    status: watch::Sender<AgentStatus>,
    wakeups: mpsc::UnboundedSender<Wakeup>,
    wakeups_rx: Option<mpsc::UnboundedReceiver<Wakeup>>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    notices_rx: Option<mpsc::UnboundedReceiver<SessionNotice>>,
}

impl<C: PeerConnector, P: MediaProducer> CaptureAgent<C, P> {
    pub fn new(
        key: SessionKey,
        connector: C,
        producer: P,
        relay: Arc<dyn SignalSink>,
        config: CaptureConfig,
    ) -> Self {
        let (wakeups, wakeups_rx) = mpsc::unbounded_channel();
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(AgentStatus {
            phase: AgentPhase::Idle,
            sessions_opened: 0,
            last_failure: None,
        });
        Self {
            key,
            connector,
            producer,
            relay,
            config,
            phase: AgentPhase::Idle,
            sessions: SessionTable::new(),
            attempts: 0,
            track_retries: 0,
            restarts: 0,
            epoch: 0,
            watchers: Vec::new(),
            status,
            wakeups,
            wakeups_rx: Some(wakeups_rx),
            notices,
            notices_rx: Some(notices_rx),
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    pub fn status(&self) -> watch::Receiver<AgentStatus> {
        self.status.subscribe()
    }

    pub fn current_session(&self) -> Option<SessionTag> {
        self.sessions.current(self.key)
    }

    fn set_phase(&mut self, phase: AgentPhase) {
        self.phase = phase;
        self.status.send_modify(|status| status.phase = phase);
    }

    fn fail(&mut self, err: Error) {
        warn!(agent = %self.key, error = %err, "capture attempt failed");
        self.set_phase(AgentPhase::Idle);
        let message = err.to_string();
        self.status
            .send_modify(|status| status.last_failure = Some(message));
    }

    fn schedule(&self, delay: Duration, wakeup: Wakeup) {
        let tx = self.wakeups.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(wakeup);
        });
    }

    fn stop_watchers(&mut self) {
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
    }

    /// Begins discovery. Ignored unless the agent is idle.
    pub async fn start(&mut self) {
        if self.phase != AgentPhase::Idle {
            debug!(agent = %self.key, phase = ?self.phase, "capture already active");
            return;
        }
        self.epoch += 1;
        self.attempts = 0;
        self.track_retries = 0;
        self.set_phase(AgentPhase::Starting);
        info!(agent = %self.key, "starting capture");
        self.discover().await;
    }

    async fn discover(&mut self) {
        self.attempts += 1;
        match self.producer.produce().await {
            Some(media) => self.build_offer(media).await,
            None if self.attempts >= self.config.discovery_attempts => {
                self.fail(Error::DiscoveryExhausted {
                    attempts: self.attempts,
                });
            }
            None => {
                debug!(agent = %self.key, attempt = self.attempts, "no media source yet");
                self.schedule(
                    self.config.discovery_interval,
                    Wakeup::Discover { epoch: self.epoch },
                );
            }
        }
    }

    /// Counts one track-readiness retry against the budget and either
    /// schedules it or gives up.
    fn retry_tracks_later(&mut self, reason: &str) {
        self.track_retries += 1;
        if self.track_retries > self.config.track_retry_limit {
            self.fail(Error::not_found(format!(
                "{reason} after {} retries",
                self.config.track_retry_limit
            )));
            return;
        }
        debug!(agent = %self.key, retry = self.track_retries, reason, "retrying capture");
        self.schedule(
            self.config.track_retry_delay,
            Wakeup::RetryTracks { epoch: self.epoch },
        );
    }

    /// Publishes `media` over a fresh session, replacing any previous one.
    pub async fn build_offer(&mut self, media: CapturedMedia) {
        if media.stream.is_empty() {
            self.retry_tracks_later("media stream has no tracks");
            return;
        }
        if let Err(err) = self.open_and_offer(&media).await {
            warn!(agent = %self.key, error = %err, "failed to build offer");
            self.sessions.teardown(self.key).await;
            self.stop_watchers();
            self.retry_tracks_later("offer could not be built");
        }
    }

    async fn open_and_offer(&mut self, media: &CapturedMedia) -> Result<()> {
        self.sessions.teardown(self.key).await;
        self.stop_watchers();

        let tag = self.sessions.allocate(self.key);
        let session = self.connector.open(tag, self.notices.clone()).await?;
        self.sessions.insert(tag, session)?;

        let offer = {
            let session = self
                .sessions
                .session(self.key)
                .ok_or_else(|| Error::internal("session vanished during offer"))?;
            for track in &media.stream.tracks {
                session.add_track(track).await?;
            }
            let offer = session.create_offer().await?;
            session.set_local_description(offer.clone()).await?;
            offer
        };

        for track in media.stream.tracks.iter().cloned() {
            let tx = self.wakeups.clone();
            self.watchers.push(tokio::spawn(async move {
                track.ended().await;
                let _ = tx.send(Wakeup::TrackEnded(tag));
            }));
        }

        info!(
            agent = %self.key,
            generation = tag.generation,
            score = %media.score,
            tracks = media.stream.tracks.len(),
            "sending offer"
        );
        self.relay
            .send(SignalEnvelope::Offer {
                source_id: self.key.source,
                sub_source_id: self.key.sub_source,
                sdp: offer,
                score: media.score,
                title: None,
            })
            .await?;

        self.set_phase(AgentPhase::Offering);
        self.status
            .send_modify(|status| status.sessions_opened += 1);
        Ok(())
    }

    /// Drops the current session and starts over right away.
    async fn reinit(&mut self) {
        info!(agent = %self.key, "re-initialising capture");
        self.sessions.teardown(self.key).await;
        self.stop_watchers();
        self.set_phase(AgentPhase::Idle);
        self.start().await;
    }

    /// Drops the current session and schedules a fresh start. Restarts
    /// share the track-retry budget until an answer is applied.
    async fn restart_later(&mut self, reason: &str) {
        self.sessions.teardown(self.key).await;
        self.stop_watchers();
        self.restarts += 1;
        if self.restarts > self.config.track_retry_limit {
            self.restarts = 0;
            self.fail(Error::transport(format!(
                "{reason}; gave up after {} restarts without an answer",
                self.config.track_retry_limit
            )));
            return;
        }
        info!(agent = %self.key, reason, restart = self.restarts, "restarting capture");
        self.set_phase(AgentPhase::Idle);
        self.schedule(
            self.config.track_retry_delay,
            Wakeup::Restart { epoch: self.epoch },
        );
    }

    pub async fn on_remote_answer(&mut self, description: SessionDescription) {
        match self.sessions.state(self.key) {
            None => {
                debug!(agent = %self.key, "answer for a torn-down session, ignoring");
                return;
            }
            Some(SessionState::Connected) => {
                debug!(agent = %self.key, "duplicate answer, ignoring");
                return;
            }
            Some(SessionState::Negotiating) => {}
        }
        match self
            .sessions
            .apply_remote_description(self.key, description)
            .await
        {
            Ok(applied) => {
                info!(agent = %self.key, queued_candidates = applied, "answer applied");
                self.restarts = 0;
                self.set_phase(AgentPhase::Connected);
            }
            Err(err) => warn!(agent = %self.key, error = %err, "rejecting answer"),
        }
    }

    pub async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        let disposition = self
            .sessions
            .add_remote_candidate(self.key, candidate)
            .await;
        debug!(agent = %self.key, ?disposition, "remote candidate");
    }

    pub async fn on_signal(&mut self, envelope: SignalEnvelope) {
        if let Some(target) = envelope.agent_target() {
            if target != self.key {
                debug!(agent = %self.key, %target, "envelope for another frame, ignoring");
                return;
            }
        }
        match envelope {
            SignalEnvelope::InitCapture => match self.phase {
                AgentPhase::Idle => self.start().await,
                AgentPhase::Starting => debug!(agent = %self.key, "already looking for media"),
                AgentPhase::Offering | AgentPhase::Connected => self.reinit().await,
            },
            SignalEnvelope::Answer { sdp, .. } => self.on_remote_answer(sdp).await,
            SignalEnvelope::CandidateFromAggregator { candidate, .. } => {
                self.on_remote_candidate(candidate).await
            }
            other => debug!(agent = %self.key, kind = other.kind(), "ignoring envelope"),
        }
    }

    pub async fn on_session_notice(&mut self, notice: SessionNotice) {
        if !self.sessions.is_current(&notice.tag) {
            debug!(agent = %self.key, generation = notice.tag.generation, "stale session event");
            return;
        }
        match notice.event {
            SessionEvent::LocalCandidate(candidate) => {
                let envelope = SignalEnvelope::Candidate {
                    source_id: self.key.source,
                    sub_source_id: self.key.sub_source,
                    candidate,
                };
                if let Err(err) = self.relay.send(envelope).await {
                    warn!(agent = %self.key, error = %err, "failed to send local candidate");
                }
            }
            SessionEvent::Connectivity(state) => {
                debug!(agent = %self.key, ?state, "connectivity");
                if state.is_terminal() && self.phase == AgentPhase::Connected {
                    self.restart_later("connection lost").await;
                }
            }
            SessionEvent::Track(track) => {
                debug!(agent = %self.key, track = %track.id, "ignoring inbound track")
            }
        }
    }

    async fn on_wakeup(&mut self, wakeup: Wakeup) {
        match wakeup {
            Wakeup::Discover { epoch } | Wakeup::RetryTracks { epoch }
                if epoch != self.epoch || self.phase != AgentPhase::Starting =>
            {
                debug!(agent = %self.key, epoch, "stale capture timer");
            }
            Wakeup::Discover { .. } => self.discover().await,
            Wakeup::RetryTracks { .. } => match self.producer.produce().await {
                Some(media) => self.build_offer(media).await,
                None => self.retry_tracks_later("media source disappeared"),
            },
            Wakeup::Restart { epoch } if epoch != self.epoch || self.phase != AgentPhase::Idle => {
                debug!(agent = %self.key, epoch, "stale restart timer");
            }
            Wakeup::Restart { .. } => self.start().await,
            Wakeup::TrackEnded(tag) => {
                if self.sessions.is_current(&tag) {
                    self.restart_later("media track ended").await;
                } else {
                    debug!(agent = %self.key, generation = tag.generation, "stale track end");
                }
            }
        }
    }

    pub async fn run(
        mut self,
        mut signals: mpsc::Receiver<SignalEnvelope>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let (Some(mut wakeups), Some(mut notices)) =
            (self.wakeups_rx.take(), self.notices_rx.take())
        else {
            warn!(agent = %self.key, "capture agent already running");
            return;
        };

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                signal = signals.recv() => match signal {
                    Some(envelope) => self.on_signal(envelope).await,
                    None => break,
                },
                Some(wakeup) = wakeups.recv() => self.on_wakeup(wakeup).await,
                Some(notice) = notices.recv() => self.on_session_notice(notice).await,
            }
        }

        self.sessions.teardown_all().await;
        self.stop_watchers();
        info!(agent = %self.key, "capture agent stopped");
    }

    pub fn spawn(self) -> AgentHandle {
        let (tx, rx) = mpsc::channel(AGENT_INBOX_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let status = self.status();
        let task = tokio::spawn(self.run(rx, shutdown_rx));
        AgentHandle {
            signals: tx,
            status,
            shutdown: shutdown_tx,
            task,
        }
    }
}

pub struct AgentHandle {
    signals: mpsc::Sender<SignalEnvelope>,
    status: watch::Receiver<AgentStatus>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl AgentHandle {
    /// Mailbox the relay delivers this agent's envelopes to.
    pub fn address(&self) -> mpsc::Sender<SignalEnvelope> {
        self.signals.clone()
    }

    pub async fn start(&self) -> Result<()> {
        self.signals
            .send(SignalEnvelope::InitCapture)
            .await
            .map_err(|_| Error::delivery("capture agent stopped"))
    }

    pub fn status(&self) -> AgentStatus {
        self.status.borrow().clone()
    }

    /// Resolves with the first status matching `pred`.
    pub async fn wait_for(&self, pred: impl Fn(&AgentStatus) -> bool) -> Result<AgentStatus> {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(|status| pred(status))
            .await
            .map_err(|_| Error::delivery("capture agent stopped"))?;
        Ok(status.clone())
    }

    /// Stops the agent and closes its session.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}
