use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use multiview_common::config::RelayConfig;
use multiview_common::{
    IceCandidate, QualityScore, SessionDescription, SessionKey, SignalEnvelope, SignalSink,
    SourceId, SubSourceId,
};
use multiview_relay::{LocalAgentHost, Relay};

async fn recv(rx: &mut mpsc::Receiver<SignalEnvelope>) -> SignalEnvelope {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for envelope")
        .expect("mailbox closed")
}

#[tokio::test]
async fn test_round_trip_between_agent_and_aggregator() {
    let host = Arc::new(LocalAgentHost::new());
    let relay = Relay::new(Arc::clone(&host), RelayConfig::default()).spawn();

    let frame = SessionKey::new(SourceId(12), SubSourceId(3));
    let (agent_tx, mut agent_rx) = mpsc::channel(16);
    host.attach(frame, agent_tx).await;
    let agent = relay.agent_port(frame, Some("Highlights".into()));

    let (aggregator_tx, mut aggregator_rx) = mpsc::channel(16);
    let aggregator = relay.aggregator_port(aggregator_tx);
    aggregator
        .send(SignalEnvelope::RegisterAggregator)
        .await
        .unwrap();

    agent
        .send(SignalEnvelope::Offer {
            source_id: SourceId(0),
            sub_source_id: SubSourceId::TOP,
            sdp: SessionDescription::offer("v=0 offer"),
            score: QualityScore(600_000),
            title: None,
        })
        .await
        .unwrap();

    match recv(&mut aggregator_rx).await {
        SignalEnvelope::Offer {
            source_id,
            sub_source_id,
            score,
            title,
            ..
        } => {
            assert_eq!(SessionKey::new(source_id, sub_source_id), frame);
            assert_eq!(score, QualityScore(600_000));
            assert_eq!(title.as_deref(), Some("Highlights"));
        }
        other => panic!("unexpected envelope {other:?}"),
    }

    aggregator
        .send(SignalEnvelope::Answer {
            target_source_id: frame.source,
            target_sub_source_id: frame.sub_source,
            sdp: SessionDescription::answer("v=0 answer"),
        })
        .await
        .unwrap();
    aggregator
        .send(SignalEnvelope::CandidateFromAggregator {
            target_source_id: frame.source,
            target_sub_source_id: frame.sub_source,
            candidate: IceCandidate::new("candidate:1 1 udp 1 10.0.0.2 7 typ host"),
        })
        .await
        .unwrap();

    assert!(matches!(
        recv(&mut agent_rx).await,
        SignalEnvelope::Answer { .. }
    ));
    assert!(matches!(
        recv(&mut agent_rx).await,
        SignalEnvelope::CandidateFromAggregator { .. }
    ));
}

#[tokio::test]
async fn test_start_capture_through_port_reaches_agents_and_registers() {
    let host = Arc::new(LocalAgentHost::new());
    let relay = Relay::new(Arc::clone(&host), RelayConfig::default()).spawn();

    let (agent_tx, mut agent_rx) = mpsc::channel(16);
    host.attach(SessionKey::top(SourceId(2)), agent_tx).await;

    let (aggregator_tx, mut aggregator_rx) = mpsc::channel(16);
    let aggregator = relay.aggregator_port(aggregator_tx);
    aggregator
        .send(SignalEnvelope::StartCapture {
            source_ids: vec![SourceId(2)],
        })
        .await
        .unwrap();
    assert_eq!(recv(&mut agent_rx).await, SignalEnvelope::InitCapture);

    // The requester became the aggregator.
    relay
        .agent_port(SessionKey::top(SourceId(2)), None)
        .send(SignalEnvelope::Candidate {
            source_id: SourceId(2),
            sub_source_id: SubSourceId::TOP,
            candidate: IceCandidate::new("candidate:2 1 udp 1 10.0.0.3 7 typ host"),
        })
        .await
        .unwrap();
    assert!(matches!(
        recv(&mut aggregator_rx).await,
        SignalEnvelope::Candidate { .. }
    ));
}
