//! Scripted in-memory connector.
//!
//! Every session records the negotiation steps applied to it, and tests can
//! raise transport callbacks (candidates, connectivity, tracks) on any
//! session through [`MockConnector::emit`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use multiview_common::{Error, IceCandidate, Result, SdpType, SessionDescription, SessionKey};

use crate::media::{MediaTrack, RemoteTrack, TrackKind};
use crate::session::{
    NoticeSender, PeerConnector, PeerSession, SessionEvent, SessionNotice, SessionTag,
};

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub tag: SessionTag,
    pub tracks: Vec<String>,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    /// Remote candidates in the order they were applied.
    pub candidates: Vec<IceCandidate>,
    pub closed: bool,
}

#[derive(Default)]
struct MockState {
    records: Vec<SessionRecord>,
    notices: HashMap<SessionTag, NoticeSender>,
    fail_open: bool,
}

#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock connector state poisoned")
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.lock().records.clone()
    }

    pub fn open_count(&self) -> usize {
        self.lock().records.len()
    }

    pub fn record(&self, tag: SessionTag) -> Option<SessionRecord> {
        self.lock().records.iter().find(|r| r.tag == tag).cloned()
    }

    /// Most recently opened session for `key`.
    pub fn latest(&self, key: SessionKey) -> Option<SessionRecord> {
        self.lock()
            .records
            .iter()
            .rev()
            .find(|r| r.tag.key == key)
            .cloned()
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    /// Raises a transport callback on the session opened under `tag`.
    pub fn emit(&self, tag: SessionTag, event: SessionEvent) -> bool {
        let sender = self.lock().notices.get(&tag).cloned();
        match sender {
            Some(tx) => tx.send(SessionNotice { tag, event }).is_ok(),
            None => false,
        }
    }

    pub fn emit_track(&self, tag: SessionTag, track_id: &str, kind: TrackKind) -> bool {
        self.emit(
            tag,
            SessionEvent::Track(RemoteTrack {
                id: track_id.to_string(),
                stream_id: format!("stream-{}", tag.key),
                kind,
                inner: None,
            }),
        )
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    type Session = MockSession;

    async fn open(&self, tag: SessionTag, notices: NoticeSender) -> Result<MockSession> {
        let mut state = self.lock();
        if state.fail_open {
            return Err(Error::transport("mock connector refused to open a session"));
        }
        state.records.push(SessionRecord {
            tag,
            tracks: Vec::new(),
            local_description: None,
            remote_description: None,
            candidates: Vec::new(),
            closed: false,
        });
        state.notices.insert(tag, notices);
        Ok(MockSession {
            tag,
            state: Arc::clone(&self.state),
        })
    }
}

pub struct MockSession {
    tag: SessionTag,
    state: Arc<Mutex<MockState>>,
}

impl MockSession {
    fn with_record<R>(&self, f: impl FnOnce(&mut SessionRecord) -> Result<R>) -> Result<R> {
        let mut state = self.state.lock().expect("mock connector state poisoned");
        let record = state
            .records
            .iter_mut()
            .find(|r| r.tag == self.tag)
            .ok_or_else(|| Error::internal("mock session record missing"))?;
        if record.closed {
            return Err(Error::transport("session closed"));
        }
        f(record)
    }
}

#[async_trait]
impl PeerSession for MockSession {
    async fn add_track(&self, track: &MediaTrack) -> Result<()> {
        self.with_record(|r| {
            r.tracks.push(track.id().to_string());
            Ok(())
        })
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let tag = self.tag;
        self.with_record(|_| {
            Ok(SessionDescription::offer(format!(
                "v=0 mock-offer {}#{}",
                tag.key, tag.generation
            )))
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let tag = self.tag;
        self.with_record(|r| {
            if r.remote_description.is_none() {
                return Err(Error::negotiation("answer requested before remote offer"));
            }
            Ok(SessionDescription::answer(format!(
                "v=0 mock-answer {}#{}",
                tag.key, tag.generation
            )))
        })
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.with_record(|r| {
            r.local_description = Some(description);
            Ok(())
        })
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.with_record(|r| {
            if description.sdp.trim().is_empty() {
                return Err(Error::negotiation("empty session description"));
            }
            let expected = match &r.local_description {
                Some(local) if local.sdp_type == SdpType::Offer => SdpType::Answer,
                _ => SdpType::Offer,
            };
            if description.sdp_type != expected {
                return Err(Error::negotiation(format!(
                    "unexpected {:?} description",
                    description.sdp_type
                )));
            }
            r.remote_description = Some(description);
            Ok(())
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.with_record(|r| {
            if r.remote_description.is_none() {
                return Err(Error::negotiation("remote description not set"));
            }
            if !candidate.candidate.starts_with("candidate:") {
                return Err(Error::negotiation(format!(
                    "malformed candidate {:?}",
                    candidate.candidate
                )));
            }
            r.candidates.push(candidate);
            Ok(())
        })
    }

    async fn close(&self) -> Result<()> {
        // Callbacks stay deliverable after close, like a late transport event.
        let mut state = self.state.lock().expect("mock connector state poisoned");
        if let Some(record) = state.records.iter_mut().find(|r| r.tag == self.tag) {
            record.closed = true;
        }
        Ok(())
    }
}
