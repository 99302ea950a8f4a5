use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use multiview_agent::{AgentPhase, CaptureAgent, CapturedMedia, MediaProducer};
use multiview_common::config::{CaptureConfig, RelayConfig};
use multiview_common::{
    QualityScore, SessionDescription, SessionKey, SignalEnvelope, SignalSink, SourceId,
    SubSourceId,
};
use multiview_relay::{LocalAgentHost, Relay, RelayCommand};
use multiview_transport::mock::MockConnector;
use multiview_transport::{MediaStream, MediaTrack, TrackEndHandle};

struct NothingToCapture {
    calls: AtomicU32,
}

#[async_trait]
impl MediaProducer for NothingToCapture {
    async fn produce(&self) -> Option<CapturedMedia> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        None
    }
}

/// Hands out a fresh single-track stream per call and keeps the end
/// handles so the test can stop tracks.
#[derive(Default)]
struct TabVideo {
    handles: Mutex<VecDeque<TrackEndHandle>>,
}

#[async_trait]
impl MediaProducer for TabVideo {
    async fn produce(&self) -> Option<CapturedMedia> {
        let (track, handle) = MediaTrack::new(Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "tab".to_owned(),
        )));
        self.handles.lock().unwrap().push_back(handle);
        Some(CapturedMedia {
            stream: MediaStream::new("tab").with_track(track),
            score: QualityScore(921_600),
        })
    }
}

/// A producer whose tracks are already over by the time they are published.
#[derive(Default)]
struct FlickeringTab {
    calls: AtomicU32,
}

#[async_trait]
impl MediaProducer for FlickeringTab {
    async fn produce(&self) -> Option<CapturedMedia> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (track, handle) = MediaTrack::new(Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "tab".to_owned(),
        )));
        handle.end();
        Some(CapturedMedia {
            stream: MediaStream::new("tab").with_track(track),
            score: QualityScore(1),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_tracks_that_end_at_once_stop_after_restart_budget() {
    let producer = Arc::new(FlickeringTab::default());
    let relay = Relay::new(Arc::new(LocalAgentHost::new()), RelayConfig::default()).spawn();
    let key = SessionKey::top(SourceId(4));
    let config = CaptureConfig::default();
    let agent = CaptureAgent::new(
        key,
        MockConnector::new(),
        producer.clone(),
        Arc::new(relay.agent_port(key, None)),
        config.clone(),
    )
    .spawn();

    agent.start().await.unwrap();
    let status = timeout(
        Duration::from_secs(600),
        agent.wait_for(|s| s.last_failure.is_some()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(status.phase, AgentPhase::Idle);
    let budget = config.track_retry_limit + 1;
    assert_eq!(status.sessions_opened, u64::from(budget));
    assert_eq!(producer.calls.load(Ordering::SeqCst), budget);

    // Nothing else is scheduled once the budget is spent.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(agent.status().sessions_opened, u64::from(budget));

    agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_discovery_budget_runs_on_virtual_clock() {
    let producer = Arc::new(NothingToCapture {
        calls: AtomicU32::new(0),
    });
    let relay = Relay::new(Arc::new(LocalAgentHost::new()), RelayConfig::default()).spawn();
    let key = SessionKey::top(SourceId(3));
    let agent = CaptureAgent::new(
        key,
        MockConnector::new(),
        producer.clone(),
        Arc::new(relay.agent_port(key, None)),
        CaptureConfig::default(),
    )
    .spawn();

    agent.start().await.unwrap();
    let status = timeout(
        Duration::from_secs(600),
        agent.wait_for(|s| s.last_failure.is_some()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(status.phase, AgentPhase::Idle);
    assert_eq!(producer.calls.load(Ordering::SeqCst), 90);
    assert_eq!(status.sessions_opened, 0);
}

async fn next_offer(rx: &mut mpsc::Receiver<SignalEnvelope>) -> SessionDescription {
    loop {
        let envelope = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for offer")
            .expect("aggregator mailbox closed");
        if let SignalEnvelope::Offer { sdp, .. } = envelope {
            return sdp;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_agent_reoffers_when_its_track_ends() {
    let host = Arc::new(LocalAgentHost::new());
    let relay = Relay::new(Arc::clone(&host), RelayConfig::default()).spawn();
    let (aggregator_tx, mut aggregator_rx) = mpsc::channel(32);
    relay
        .send(RelayCommand::RegisterAggregator(aggregator_tx.clone()))
        .await
        .unwrap();

    let key = SessionKey::new(SourceId(5), SubSourceId(2));
    let producer = Arc::new(TabVideo::default());
    let agent = CaptureAgent::new(
        key,
        MockConnector::new(),
        producer.clone(),
        Arc::new(relay.agent_port(key, Some("Stream".into()))),
        CaptureConfig::default(),
    )
    .spawn();
    host.attach(key, agent.address()).await;

    // Ask the whole tab to capture, the way the aggregator does.
    relay
        .send(RelayCommand::StartCapture {
            source_ids: vec![key.source],
            requester: None,
        })
        .await
        .unwrap();
    let first = next_offer(&mut aggregator_rx).await;

    let aggregator = relay.aggregator_port(aggregator_tx);
    aggregator
        .send(SignalEnvelope::Answer {
            target_source_id: key.source,
            target_sub_source_id: key.sub_source,
            sdp: SessionDescription::answer("v=0 answer"),
        })
        .await
        .unwrap();
    timeout(
        Duration::from_secs(5),
        agent.wait_for(|s| s.phase == AgentPhase::Connected),
    )
    .await
    .unwrap()
    .unwrap();

    let handle = producer.handles.lock().unwrap().pop_front().unwrap();
    handle.end();

    let second = next_offer(&mut aggregator_rx).await;
    assert_ne!(first.sdp, second.sdp);
    let status = agent
        .wait_for(|s| s.sessions_opened == 2)
        .await
        .unwrap();
    assert_eq!(status.phase, AgentPhase::Offering);

    agent.shutdown().await;
}
