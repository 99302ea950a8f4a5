//! Arena of live sessions addressed by key plus generation.
//!
//! Every session opened for a key gets a fresh generation from a counter
//! that only moves forward, so a callback captured by an older incarnation
//! can tell it has been superseded by comparing tags.

use std::collections::HashMap;

use tracing::{debug, warn};

use multiview_common::{Error, IceCandidate, Result, SessionDescription, SessionKey};

use crate::candidates::CandidateQueue;
use crate::session::{PeerSession, SessionTag};

/// Closed sessions leave the table, so only live states are tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Local description set, remote not yet.
    Negotiating,
    /// Remote description set.
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Queued,
    Rejected,
}

struct Slot<S> {
    generation: u64,
    state: SessionState,
    session: S,
}

pub struct SessionTable<S> {
    slots: HashMap<SessionKey, Slot<S>>,
    pending: HashMap<SessionKey, CandidateQueue>,
    next_generation: u64,
}

impl<S> Default for SessionTable<S> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            pending: HashMap::new(),
            next_generation: 0,
        }
    }
}

impl<S: PeerSession> SessionTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the tag for the next session opened under `key`.
    pub fn allocate(&mut self, key: SessionKey) -> SessionTag {
        self.next_generation += 1;
        SessionTag {
            key,
            generation: self.next_generation,
        }
    }

    /// Stores a freshly opened session. Fails if a live session still holds
    /// the key; callers tear the old one down first.
    pub fn insert(&mut self, tag: SessionTag, session: S) -> Result<()> {
        if self.slots.contains_key(&tag.key) {
            return Err(Error::internal(format!(
                "session {} still live, tear it down first",
                tag.key
            )));
        }
        self.slots.insert(
            tag.key,
            Slot {
                generation: tag.generation,
                state: SessionState::Negotiating,
                session,
            },
        );
        Ok(())
    }

    pub fn is_current(&self, tag: &SessionTag) -> bool {
        self.slots
            .get(&tag.key)
            .is_some_and(|slot| slot.generation == tag.generation)
    }

    pub fn current(&self, key: SessionKey) -> Option<SessionTag> {
        self.slots.get(&key).map(|slot| SessionTag {
            key,
            generation: slot.generation,
        })
    }

    pub fn state(&self, key: SessionKey) -> Option<SessionState> {
        self.slots.get(&key).map(|slot| slot.state)
    }

    pub fn session(&self, key: SessionKey) -> Option<&S> {
        self.slots.get(&key).map(|slot| &slot.session)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn pending_len(&self, key: SessionKey) -> usize {
        self.pending.get(&key).map_or(0, CandidateQueue::len)
    }

    /// Drops candidates queued for `key` without touching its session.
    pub fn discard_pending(&mut self, key: SessionKey) -> usize {
        self.pending.remove(&key).map_or(0, |queue| queue.len())
    }

    /// Closes and forgets the session for `key` together with its queued
    /// candidates. Returns the tag of the session that was removed.
    ///
    /// Candidates queued while no session existed are kept for the next one.
    pub async fn teardown(&mut self, key: SessionKey) -> Option<SessionTag> {
        let slot = self.slots.remove(&key)?;
        self.pending.remove(&key);
        if let Err(err) = slot.session.close().await {
            debug!(session = %key, generation = slot.generation, error = %err, "close failed");
        }
        Some(SessionTag {
            key,
            generation: slot.generation,
        })
    }

    pub async fn teardown_all(&mut self) {
        let keys: Vec<SessionKey> = self.slots.keys().copied().collect();
        for key in keys {
            self.teardown(key).await;
        }
    }

    /// Sets the remote description, then applies every queued candidate in
    /// arrival order. Returns how many queued candidates were applied.
    ///
    /// On failure the session keeps its previous state and queue.
    pub async fn apply_remote_description(
        &mut self,
        key: SessionKey,
        description: SessionDescription,
    ) -> Result<usize> {
        let slot = self
            .slots
            .get_mut(&key)
            .ok_or_else(|| Error::not_found(format!("no session for {key}")))?;
        slot.session.set_remote_description(description).await?;
        slot.state = SessionState::Connected;

        let queued = self
            .pending
            .get_mut(&key)
            .map(CandidateQueue::drain)
            .unwrap_or_default();
        let mut applied = 0;
        for candidate in queued {
            match slot.session.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(err) => {
                    warn!(session = %key, error = %err, "skipping queued ICE candidate")
                }
            }
        }
        Ok(applied)
    }

    /// Applies a remote candidate now if the session has its remote
    /// description, otherwise queues it for the next drain. A full queue
    /// rejects the candidate.
    pub async fn add_remote_candidate(
        &mut self,
        key: SessionKey,
        candidate: IceCandidate,
    ) -> CandidateDisposition {
        match self.slots.get(&key) {
            Some(slot) if slot.state == SessionState::Connected => {
                match slot.session.add_ice_candidate(candidate).await {
                    Ok(()) => CandidateDisposition::Applied,
                    Err(err) => {
                        warn!(session = %key, error = %err, "skipping ICE candidate");
                        CandidateDisposition::Rejected
                    }
                }
            }
            _ => match self.pending.entry(key).or_default().push(candidate) {
                Ok(()) => CandidateDisposition::Queued,
                Err(_) => {
                    warn!(session = %key, "candidate queue full, dropping ICE candidate");
                    CandidateDisposition::Rejected
                }
            },
        }
    }
}
