use std::sync::Arc;

use async_trait::async_trait;

use multiview_common::QualityScore;
use multiview_transport::MediaStream;

/// Smallest frame area (64x64) worth capturing.
pub const MIN_CAPTURE_AREA: u64 = 4096;
const PLAYING_BONUS: i64 = 500_000;
const READY_BONUS: i64 = 100_000;
/// `HAVE_FUTURE_DATA`: enough is buffered to keep playing.
const READY_STATE_FUTURE_DATA: u8 = 3;

#[derive(Debug, Clone)]
pub struct CapturedMedia {
    pub stream: MediaStream,
    pub score: QualityScore,
}

/// Finds capturable media in the agent's page context.
#[async_trait]
pub trait MediaProducer: Send + Sync + 'static {
    /// `None` while no eligible source exists yet.
    async fn produce(&self) -> Option<CapturedMedia>;
}

#[async_trait]
impl<P: MediaProducer + ?Sized> MediaProducer for Arc<P> {
    async fn produce(&self) -> Option<CapturedMedia> {
        (**self).produce().await
    }
}

/// Geometry and playback facts about one candidate video source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoSignal {
    pub width: u32,
    pub height: u32,
    pub playing: bool,
    /// HTML media `readyState`, 0 through 4.
    pub ready_state: u8,
    /// Playback position has moved past zero.
    pub progressed: bool,
}

impl VideoSignal {
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn is_eligible(&self) -> bool {
        let ready = self.ready_state >= 1 || self.progressed || self.playing;
        self.area() >= MIN_CAPTURE_AREA && ready
    }

    pub fn score(&self) -> QualityScore {
        let mut score = i64::try_from(self.area()).unwrap_or(i64::MAX);
        if self.playing {
            score = score.saturating_add(PLAYING_BONUS);
        }
        if self.ready_state >= READY_STATE_FUTURE_DATA {
            score = score.saturating_add(READY_BONUS);
        }
        QualityScore(score)
    }

    /// Index and score of the best eligible source, if any.
    pub fn pick_best(signals: &[VideoSignal]) -> Option<(usize, QualityScore)> {
        signals
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_eligible())
            .map(|(i, s)| (i, s.score()))
            .max_by_key(|(_, score)| *score)
    }
}
