//! Signaling envelopes exchanged between capture agents, the relay and the
//! aggregator.
//!
//! Envelopes are JSON objects tagged by `type`. Session descriptions and ICE
//! candidates keep the field names browsers use so that a page-side agent
//! can forward them without translation.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::{QualityScore, SessionKey, SourceId, SubSourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalEnvelope {
    /// An out-of-process agent announcing which context it captures.
    BindAgent {
        source_id: SourceId,
        #[serde(default)]
        sub_source_id: SubSourceId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    RegisterAggregator,

    Offer {
        source_id: SourceId,
        #[serde(default)]
        sub_source_id: SubSourceId,
        sdp: SessionDescription,
        #[serde(default)]
        score: QualityScore,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    Candidate {
        source_id: SourceId,
        #[serde(default)]
        sub_source_id: SubSourceId,
        candidate: IceCandidate,
    },
    Answer {
        target_source_id: SourceId,
        #[serde(default)]
        target_sub_source_id: SubSourceId,
        sdp: SessionDescription,
    },
    CandidateFromAggregator {
        target_source_id: SourceId,
        #[serde(default)]
        target_sub_source_id: SubSourceId,
        candidate: IceCandidate,
    },

    /// Fan-out request; never forwarded as-is.
    StartCapture {
        source_ids: Vec<SourceId>,
    },
    /// Per-target re-init request produced by a `StartCapture` fan-out.
    InitCapture,

    Error {
        message: String,
    },
}

impl SignalEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BindAgent { .. } => "BIND_AGENT",
            Self::RegisterAggregator => "REGISTER_AGGREGATOR",
            Self::Offer { .. } => "OFFER",
            Self::Candidate { .. } => "CANDIDATE",
            Self::Answer { .. } => "ANSWER",
            Self::CandidateFromAggregator { .. } => "CANDIDATE_FROM_AGGREGATOR",
            Self::StartCapture { .. } => "START_CAPTURE",
            Self::InitCapture => "INIT_CAPTURE",
            Self::Error { .. } => "ERROR",
        }
    }

    /// The agent context an aggregator-originated envelope is addressed to.
    pub fn agent_target(&self) -> Option<SessionKey> {
        match self {
            Self::Answer {
                target_source_id,
                target_sub_source_id,
                ..
            }
            | Self::CandidateFromAggregator {
                target_source_id,
                target_sub_source_id,
                ..
            } => Some(SessionKey::new(*target_source_id, *target_sub_source_id)),
            _ => None,
        }
    }

    /// Overwrites the sender identity of an agent-originated envelope with the
    /// context it actually arrived from. Returns `None` for kinds agents may
    /// not send.
    pub fn stamp_origin(self, origin: SessionKey, origin_title: Option<&str>) -> Option<Self> {
        match self {
            Self::Offer {
                sdp, score, title, ..
            } => Some(Self::Offer {
                source_id: origin.source,
                sub_source_id: origin.sub_source,
                sdp,
                score,
                title: origin_title.map(str::to_owned).or(title),
            }),
            Self::Candidate { candidate, .. } => Some(Self::Candidate {
                source_id: origin.source,
                sub_source_id: origin.sub_source,
                candidate,
            }),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::serialization)
    }

    /// Parses an inbound envelope; anything unparseable is a protocol error.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(Error::protocol)
    }
}
