use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use multiview_agent::{AgentPhase, CaptureAgent, CapturedMedia, MediaProducer};
use multiview_aggregator::{
    mailbox, Aggregator, ChannelSink, MemorySelection, PresentationUpdate,
};
use multiview_common::config::{AggregatorConfig, CaptureConfig, RelayConfig};
use multiview_common::{
    QualityScore, SessionDescription, SessionKey, SignalEnvelope, SignalSink, SourceId,
    SubSourceId,
};
use multiview_gateway::{GatewayLink, GatewayState};
use multiview_transport::mock::MockConnector;
use multiview_transport::{MediaStream, MediaTrack, TrackEndHandle, TrackKind};

async fn start_gateway() -> (GatewayState, String, u16) {
    let state = GatewayState::new(RelayConfig::default(), None);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(multiview_gateway::serve(listener, state.clone()));
    (state, format!("ws://127.0.0.1:{port}/ws"), port)
}

async fn wait_for_agents(state: &GatewayState, count: usize) {
    timeout(Duration::from_secs(5), async {
        while state.host.agent_count().await != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("agent count");
}

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
            "video".to_owned(),
            "tab".to_owned(),
        )));
        self.handles.lock().unwrap().push(handle);
        Some(CapturedMedia {
            stream: MediaStream::new("tab").with_track(track),
            score: QualityScore(500_000),
        })
    }
}

#[tokio::test]
async fn test_health_reports_ok() {
    let (_state, _url, port) = start_gateway().await;
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("\"status\":\"ok\""), "{response}");
}

#[tokio::test]
async fn test_offer_before_bind_is_refused() {
    let (_state, url, _) = start_gateway().await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    let offer = SignalEnvelope::Offer {
        source_id: SourceId(1),
        sub_source_id: SubSourceId::TOP,
        sdp: SessionDescription::offer("v=0"),
        score: QualityScore(1),
        title: None,
    };
    ws.send(Message::Text(offer.to_json().unwrap().into()))
        .await
        .unwrap();

    assert_eq!(
        next_error(&mut ws).await,
        "BIND_AGENT required before signaling"
    );
    expect_closed(&mut ws).await;
}

async fn next_error<S>(ws: &mut S) -> String
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let reply = timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Text(text) = reply else {
        panic!("expected text reply, got {reply:?}");
    };
    match SignalEnvelope::from_json(&text).unwrap() {
        SignalEnvelope::Error { message } => message,
        other => panic!("expected error, got {other:?}"),
    }
}

async fn expect_closed<S>(ws: &mut S)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    match timeout(Duration::from_secs(5), ws.next()).await.unwrap() {
        None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
        Some(Ok(other)) => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_queued_errors_are_flushed_before_close() {
    let (_state, url, _) = start_gateway().await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

    for _ in 0..3 {
        ws.send(Message::Text("{not json".into())).await.unwrap();
    }
    ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();

    for _ in 0..3 {
        assert_eq!(next_error(&mut ws).await, "Invalid JSON");
    }
    assert_eq!(
        next_error(&mut ws).await,
        "Binary messages are not supported"
    );
    expect_closed(&mut ws).await;
}

#[tokio::test]
async fn test_disconnecting_agent_is_detached() {
    let (state, url, _) = start_gateway().await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    let bind = SignalEnvelope::BindAgent {
        source_id: SourceId(8),
        sub_source_id: SubSourceId(2),
        title: Some("Docs".into()),
    };
    ws.send(Message::Text(bind.to_json().unwrap().into()))
        .await
        .unwrap();
    wait_for_agents(&state, 1).await;

    ws.close(None).await.unwrap();
    drop(ws);
    wait_for_agents(&state, 0).await;
}

#[tokio::test]
async fn test_agent_and_aggregator_negotiate_through_gateway() {
    let (state, url, _) = start_gateway().await;
    let key = SessionKey::top(SourceId(5));

    let (agent_inbox, mut agent_incoming) = mpsc::channel(64);
    let agent_link = GatewayLink::connect(&url, agent_inbox).await.unwrap();
    agent_link
        .send(SignalEnvelope::BindAgent {
            source_id: key.source,
            sub_source_id: key.sub_source,
            title: Some("Cam".into()),
        })
        .await
        .unwrap();
    let agent = CaptureAgent::new(
        key,
        MockConnector::new(),
        Arc::new(TabVideo::default()),
        Arc::new(agent_link),
        CaptureConfig::default(),
    )
    .spawn();
    let agent_address = agent.address();
    tokio::spawn(async move {
        while let Some(envelope) = agent_incoming.recv().await {
            if agent_address.send(envelope).await.is_err() {
                break;
            }
        }
    });
    wait_for_agents(&state, 1).await;

    let viewer = MockConnector::new();
    let (sink, mut updates) = ChannelSink::channel();
    let (address, inbox) = mailbox();
    let aggregator_link = GatewayLink::connect(&url, address).await.unwrap();
    let aggregator = Aggregator::new(
        viewer.clone(),
        Arc::new(aggregator_link),
        Arc::new(MemorySelection::new([key.source])),
        Arc::new(sink),
        // Only the immediate first tick matters here.
        AggregatorConfig {
            reconcile_interval: Duration::from_secs(600),
            ..AggregatorConfig::default()
        },
    )
    .spawn(inbox);

    timeout(
        Duration::from_secs(10),
        agent.wait_for(|s| s.phase == AgentPhase::Connected),
    )
    .await
    .expect("agent connects")
    .unwrap();

    let session = viewer.latest(key).expect("aggregator session");
    assert!(viewer.emit_track(session.tag, "remote-video", TrackKind::Video));
    let update = timeout(Duration::from_secs(5), updates.recv())
        .await
        .unwrap()
        .unwrap();
    match update {
        PresentationUpdate::Upsert { source, stream } => {
            assert_eq!(source, key.source);
            assert_eq!(stream.title.as_deref(), Some("Cam"));
        }
        other => panic!("unexpected update {other:?}"),
    }

    aggregator.shutdown().await;
    agent.shutdown().await;
}
