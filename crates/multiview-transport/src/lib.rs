//! Peer session plumbing shared by capture agents and the aggregator.
//!
//! The real-time transport itself comes from the `webrtc` crate. This crate
//! only puts a narrow async seam in front of it ([`PeerConnector`] and
//! [`PeerSession`]) and supplies the bookkeeping both endpoints need: a
//! generation-tagged [`SessionTable`] and an ordered [`CandidateQueue`].

#![forbid(unsafe_code)]

pub mod candidates;
pub mod media;
pub mod rtc;
pub mod session;
pub mod table;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use candidates::{CandidateQueue, MAX_PENDING_CANDIDATES};
pub use media::{MediaStream, MediaTrack, RemoteTrack, TrackEndHandle, TrackKind};
pub use rtc::{WebRtcConnector, WebRtcSession};
pub use session::{
    ConnectivityState, NoticeSender, PeerConnector, PeerSession, SessionEvent, SessionNotice,
    SessionTag,
};
pub use table::{CandidateDisposition, SessionState, SessionTable};
