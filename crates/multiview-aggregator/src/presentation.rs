//! Hand-off of winning streams to whatever renders them.

use tokio::sync::mpsc;

use multiview_common::{SourceId, SubSourceId};
use multiview_transport::RemoteTrack;

/// The live stream currently shown for one source.
#[derive(Debug, Clone)]
pub struct ExposedStream {
    pub sub_source: SubSourceId,
    /// Generation of the session the tracks arrived on.
    pub generation: u64,
    pub title: Option<String>,
    pub stream_id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl ExposedStream {
    pub fn track_ids(&self) -> Vec<&str> {
        self.tracks.iter().map(|t| t.id.as_str()).collect()
    }
}

/// Receives upserts and removals keyed by source. Display order is derived
/// from the selection by the presentation side.
pub trait PresentationSink: Send + Sync + 'static {
    fn upsert(&self, source: SourceId, stream: &ExposedStream);

    fn remove(&self, source: SourceId);
}

#[derive(Debug, Clone)]
pub enum PresentationUpdate {
    Upsert {
        source: SourceId,
        stream: ExposedStream,
    },
    Remove {
        source: SourceId,
    },
}

/// Forwards every update into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PresentationUpdate>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PresentationUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PresentationSink for ChannelSink {
    fn upsert(&self, source: SourceId, stream: &ExposedStream) {
        let _ = self.tx.send(PresentationUpdate::Upsert {
            source,
            stream: stream.clone(),
        });
    }

    fn remove(&self, source: SourceId) {
        let _ = self.tx.send(PresentationUpdate::Remove { source });
    }
}
