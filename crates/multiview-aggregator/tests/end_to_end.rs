//! Relay, capture agent and aggregator wired together over mock transports.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use multiview_agent::{AgentPhase, CaptureAgent, CapturedMedia, MediaProducer};
use multiview_aggregator::{
    mailbox, Aggregator, ChannelSink, MemorySelection, PresentationUpdate,
};
use multiview_common::config::{AggregatorConfig, CaptureConfig, RelayConfig};
use multiview_common::{QualityScore, SessionKey, SourceId};
use multiview_relay::{LocalAgentHost, Relay};
use multiview_transport::mock::MockConnector;
use multiview_transport::{
    ConnectivityState, MediaStream, MediaTrack, SessionEvent, TrackEndHandle, TrackKind,
};

/// Keeps every end handle so published tracks stay live for the test.
#[derive(Default)]
struct TabVideo {
    handles: Mutex<Vec<TrackEndHandle>>,
}

#[async_trait]
impl MediaProducer for TabVideo {
    async fn produce(&self) -> Option<CapturedMedia> {
        let (track, handle) = MediaTrack::new(Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            format!("video-{}", uuid::Uuid::new_v4()),
            "tab".to_owned(),
        )));
        self.handles.lock().unwrap().push(handle);
        Some(CapturedMedia {
            stream: MediaStream::new("tab").with_track(track),
            score: QualityScore(600_000),
        })
    }
}

async fn next_update(updates: &mut mpsc::UnboundedReceiver<PresentationUpdate>) -> PresentationUpdate {
    timeout(Duration::from_secs(30), updates.recv())
        .await
        .expect("presentation update")
        .expect("presentation channel open")
}

#[tokio::test(start_paused = true)]
async fn test_selected_tab_is_captured_exposed_and_healed() {
    let host = Arc::new(LocalAgentHost::new());
    let relay = Relay::new(host.clone(), RelayConfig::default()).spawn();

    let key = SessionKey::top(SourceId(5));
    let agent = CaptureAgent::new(
        key,
        MockConnector::new(),
        Arc::new(TabVideo::default()),
        Arc::new(relay.agent_port(key, Some("Stadium cam".into()))),
        CaptureConfig::default(),
    )
    .spawn();
    host.attach(key, agent.address()).await;

    let viewer = MockConnector::new();
    let (sink, mut updates) = ChannelSink::channel();
    let (address, inbox) = mailbox();
    let aggregator = Aggregator::new(
        viewer.clone(),
        Arc::new(relay.aggregator_port(address)),
        Arc::new(MemorySelection::new([SourceId(5)])),
        Arc::new(sink),
        AggregatorConfig::default(),
    )
    .spawn(inbox);

    // The first reconciliation tick asks the relay to start the agent.
    let status = timeout(
        Duration::from_secs(5),
        agent.wait_for(|s| s.phase == AgentPhase::Connected),
    )
    .await
    .expect("agent connects")
    .unwrap();
    assert_eq!(status.sessions_opened, 1);

    let first = viewer.latest(key).expect("aggregator session");
    assert!(viewer.emit_track(first.tag, "remote-video", TrackKind::Video));
    match next_update(&mut updates).await {
        PresentationUpdate::Upsert { source, stream } => {
            assert_eq!(source, SourceId(5));
            assert_eq!(stream.track_ids(), vec!["remote-video"]);
            assert_eq!(stream.title.as_deref(), Some("Stadium cam"));
        }
        other => panic!("unexpected update {other:?}"),
    }

    // The viewer side loses the session; the next tick re-requests capture
    // and the agent publishes a fresh offer.
    assert!(viewer.emit(
        first.tag,
        SessionEvent::Connectivity(ConnectivityState::Failed)
    ));
    assert!(matches!(
        next_update(&mut updates).await,
        PresentationUpdate::Remove {
            source: SourceId(5)
        }
    ));

    let status = timeout(
        Duration::from_secs(30),
        agent.wait_for(|s| s.sessions_opened == 2 && s.phase == AgentPhase::Connected),
    )
    .await
    .expect("agent re-offers")
    .unwrap();
    assert!(status.last_failure.is_none());

    let second = viewer.latest(key).unwrap();
    assert!(second.tag.generation > first.tag.generation);
    assert!(viewer.record(first.tag).unwrap().closed);

    aggregator.shutdown().await;
    agent.shutdown().await;
}
