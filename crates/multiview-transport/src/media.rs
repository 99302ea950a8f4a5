//! Local and remote media handles passed across the session seam.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
    Unspecified,
}

impl From<RTPCodecType> for TrackKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Audio => TrackKind::Audio,
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Unspecified,
        }
    }
}

/// A track a media producer feeds and a capture agent publishes.
#[derive(Clone)]
pub struct MediaTrack {
    local: Arc<dyn TrackLocal + Send + Sync>,
    ended: watch::Receiver<bool>,
}

/// Held by the media producer; ending it (or dropping it) ends the track.
#[derive(Debug)]
pub struct TrackEndHandle {
    tx: watch::Sender<bool>,
}

impl TrackEndHandle {
    pub fn end(&self) {
        self.tx.send_replace(true);
    }
}

impl MediaTrack {
    pub fn new(local: Arc<dyn TrackLocal + Send + Sync>) -> (Self, TrackEndHandle) {
        let (tx, ended) = watch::channel(false);
        (Self { local, ended }, TrackEndHandle { tx })
    }

    pub fn id(&self) -> &str {
        self.local.id()
    }

    pub fn kind(&self) -> TrackKind {
        self.local.kind().into()
    }

    pub fn local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.local)
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Resolves once the producer ends the track or goes away.
    pub async fn ended(&self) {
        let mut rx = self.ended.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("ended", &self.is_ended())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn with_track(mut self, track: MediaTrack) -> Self {
        self.tracks.push(track);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// A track received from the remote peer.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    /// The live transport track; absent for scripted tracks in tests.
    pub inner: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn from_transport(track: Arc<TrackRemote>) -> Self {
        Self {
            id: track.id(),
            stream_id: track.stream_id(),
            kind: track.kind().into(),
            inner: Some(track),
        }
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use webrtc::api::media_engine::MIME_TYPE_VP8;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

    fn video_track() -> (MediaTrack, TrackEndHandle) {
        MediaTrack::new(Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "tab".to_owned(),
        )))
    }

    #[tokio::test]
    async fn test_track_ends_when_handle_ends() {
        let (track, handle) = video_track();
        assert_eq!(track.id(), "video");
        assert_eq!(track.kind(), TrackKind::Video);
        assert!(!track.is_ended());

        let waiter = track.clone();
        let join = tokio::spawn(async move { waiter.ended().await });
        handle.end();
        tokio::time::timeout(Duration::from_secs(1), join)
            .await
            .unwrap()
            .unwrap();
        assert!(track.is_ended());
    }

    #[tokio::test]
    async fn test_track_ends_when_handle_dropped() {
        let (track, handle) = video_track();
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), track.ended())
            .await
            .unwrap();
    }
}
