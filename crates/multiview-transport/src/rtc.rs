//! `webrtc`-crate backed sessions.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;

use multiview_common::config::IceConfig;
use multiview_common::{Error, IceCandidate, Result, SdpType, SessionDescription};

use crate::media::{MediaTrack, RemoteTrack};
use crate::session::{
    ConnectivityState, NoticeSender, PeerConnector, PeerSession, SessionEvent, SessionNotice,
    SessionTag,
};

impl From<RTCPeerConnectionState> for ConnectivityState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
            RTCPeerConnectionState::Connected => ConnectivityState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectivityState::Failed,
            RTCPeerConnectionState::Closed => ConnectivityState::Closed,
            _ => ConnectivityState::New,
        }
    }
}

fn candidate_from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn candidate_to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(Error::negotiation)
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        other => {
            return Err(Error::negotiation(format!(
                "unsupported description type {other}"
            )))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

pub struct WebRtcConnector {
    api: API,
    ice: IceConfig,
}

impl WebRtcConnector {
    pub fn new(ice: IceConfig) -> Result<Self> {
        let mut m = MediaEngine::default();
        m.register_default_codecs().map_err(Error::transport)?;
        let api = APIBuilder::new().with_media_engine(m).build();
        Ok(Self { api, ice })
    }

    fn rtc_config(&self) -> RTCConfiguration {
        let ice_servers = if self.ice.stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice.stun_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    type Session = WebRtcSession;

    async fn open(&self, tag: SessionTag, notices: NoticeSender) -> Result<WebRtcSession> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config())
                .await
                .map_err(Error::transport)?,
        );

        let tx = notices.clone();
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = c else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(SessionNotice {
                            tag,
                            event: SessionEvent::LocalCandidate(candidate_from_init(init)),
                        });
                    }
                    Err(err) => warn!(session = %tag.key, error = %err, "unserializable local candidate"),
                }
            })
        }));

        let tx = notices.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!(session = %tag.key, generation = tag.generation, %state, "peer connection state");
                let _ = tx.send(SessionNotice {
                    tag,
                    event: SessionEvent::Connectivity(state.into()),
                });
            })
        }));

        let tx = notices;
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(SessionNotice {
                    tag,
                    event: SessionEvent::Track(RemoteTrack::from_transport(track)),
                });
            })
        }));

        Ok(WebRtcSession { tag, pc })
    }
}

pub struct WebRtcSession {
    tag: SessionTag,
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerSession for WebRtcSession {
    async fn add_track(&self, track: &MediaTrack) -> Result<()> {
        let rtp_sender = self
            .pc
            .add_track(track.local())
            .await
            .map_err(Error::transport)?;

        // RTCP has to be read for interceptors (NACK, PLI) to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtp_sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(Error::negotiation)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(Error::negotiation)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(Error::negotiation)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(Error::negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(candidate_to_init(candidate))
            .await
            .map_err(Error::negotiation)
    }

    async fn close(&self) -> Result<()> {
        debug!(session = %self.tag.key, generation = self.tag.generation, "closing peer connection");
        self.pc.close().await.map_err(Error::transport)
    }
}
