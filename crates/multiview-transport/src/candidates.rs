use std::collections::VecDeque;

use multiview_common::IceCandidate;

/// Candidates held per key before a remote description lands.
pub const MAX_PENDING_CANDIDATES: usize = 64;

/// Remote ICE candidates that arrived before the remote description was set.
///
/// Appendable until [`MAX_PENDING_CANDIDATES`] are held; drained in arrival
/// order, each candidate exactly once.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `candidate`, or hands it back when the queue is full.
    pub fn push(&mut self, candidate: IceCandidate) -> Result<(), IceCandidate> {
        if self.pending.len() >= MAX_PENDING_CANDIDATES {
            return Err(candidate);
        }
        self.pending.push_back(candidate);
        Ok(())
    }

    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_preserves_arrival_order_once() {
        let mut queue = CandidateQueue::new();
        for c in ["a", "b", "c"] {
            queue.push(IceCandidate::new(c)).unwrap();
        }

        let drained: Vec<_> = queue.drain().into_iter().map(|c| c.candidate).collect();
        assert_eq!(drained, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_full_queue_hands_candidate_back() {
        let mut queue = CandidateQueue::new();
        for n in 0..MAX_PENDING_CANDIDATES {
            queue.push(IceCandidate::new(format!("c{n}"))).unwrap();
        }
        let refused = queue.push(IceCandidate::new("late")).unwrap_err();
        assert_eq!(refused.candidate, "late");
        assert_eq!(queue.len(), MAX_PENDING_CANDIDATES);
        assert_eq!(queue.drain()[0].candidate, "c0");
    }
}
