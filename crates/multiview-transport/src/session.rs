use async_trait::async_trait;
use tokio::sync::mpsc;

use multiview_common::{IceCandidate, Result, SessionDescription, SessionKey};

use crate::media::{MediaTrack, RemoteTrack};

/// Identifies one incarnation of a session: the key it negotiates for and
/// the generation it was opened under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionTag {
    pub key: SessionKey,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectivityState::Disconnected | ConnectivityState::Failed | ConnectivityState::Closed
        )
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    LocalCandidate(IceCandidate),
    Connectivity(ConnectivityState),
    Track(RemoteTrack),
}

/// A transport callback, tagged with the session incarnation that raised it.
#[derive(Debug, Clone)]
pub struct SessionNotice {
    pub tag: SessionTag,
    pub event: SessionEvent,
}

pub type NoticeSender = mpsc::UnboundedSender<SessionNotice>;

/// Opens peer sessions. Callbacks of every opened session are delivered
/// through `notices` so the owning component can check them for staleness
/// before acting.
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    type Session: PeerSession;

    async fn open(&self, tag: SessionTag, notices: NoticeSender) -> Result<Self::Session>;
}

#[async_trait]
pub trait PeerSession: Send + Sync + 'static {
    async fn add_track(&self, track: &MediaTrack) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
