//! Per-source arbitration between competing sub-sources.
//!
//! A different sub-source only takes over when its score is strictly greater
//! than the incumbent's; equal scores keep the incumbent.

use std::collections::HashMap;

use multiview_common::{QualityScore, SessionKey, SourceId, SubSourceId};

/// The sub-source currently authoritative for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSource {
    pub sub_source: SubSourceId,
    pub score: QualityScore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arbitration {
    /// `displaced` is the previous winner when it was a different sub-source.
    Accept { displaced: Option<SubSourceId> },
    Reject { incumbent: ActiveSource },
}

impl Arbitration {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Arbitration::Accept { .. })
    }
}

#[derive(Debug, Default)]
pub struct ArbitrationTable {
    active: HashMap<SourceId, ActiveSource>,
}

impl ArbitrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides an incoming offer without changing the table.
    pub fn arbitrate(&self, key: SessionKey, score: QualityScore) -> Arbitration {
        match self.active.get(&key.source) {
            None => Arbitration::Accept { displaced: None },
            Some(incumbent) if incumbent.sub_source == key.sub_source => {
                Arbitration::Accept { displaced: None }
            }
            Some(incumbent) if score > incumbent.score => Arbitration::Accept {
                displaced: Some(incumbent.sub_source),
            },
            Some(incumbent) => Arbitration::Reject {
                incumbent: *incumbent,
            },
        }
    }

    pub fn commit(&mut self, key: SessionKey, score: QualityScore) {
        self.active.insert(
            key.source,
            ActiveSource {
                sub_source: key.sub_source,
                score,
            },
        );
    }

    pub fn get(&self, source: SourceId) -> Option<ActiveSource> {
        self.active.get(&source).copied()
    }

    /// Whether signaling for `key` is still relevant: no winner yet, or the
    /// winner is this very sub-source.
    pub fn admits(&self, key: SessionKey) -> bool {
        self.active
            .get(&key.source)
            .map_or(true, |active| active.sub_source == key.sub_source)
    }

    pub fn is_winner(&self, key: SessionKey) -> bool {
        self.active
            .get(&key.source)
            .is_some_and(|active| active.sub_source == key.sub_source)
    }

    /// Clears the entry for `key.source` only if it still names
    /// `key.sub_source`.
    pub fn clear_if_winner(&mut self, key: SessionKey) -> bool {
        if self.is_winner(key) {
            self.active.remove(&key.source);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(source: u64, sub: u64) -> SessionKey {
        SessionKey::new(SourceId(source), SubSourceId(sub))
    }

    fn offer(table: &mut ArbitrationTable, key: SessionKey, score: i64) -> Arbitration {
        let decision = table.arbitrate(key, QualityScore(score));
        if decision.is_accepted() {
            table.commit(key, QualityScore(score));
        }
        decision
    }

    #[test]
    fn test_strictly_greater_score_displaces_incumbent() {
        let mut table = ArbitrationTable::new();
        assert_eq!(
            offer(&mut table, key(7, 0), 100),
            Arbitration::Accept { displaced: None }
        );
        assert!(!offer(&mut table, key(7, 1), 50).is_accepted());
        assert_eq!(
            offer(&mut table, key(7, 1), 150),
            Arbitration::Accept {
                displaced: Some(SubSourceId(0))
            }
        );
        assert_eq!(
            table.get(SourceId(7)),
            Some(ActiveSource {
                sub_source: SubSourceId(1),
                score: QualityScore(150)
            })
        );
    }

    #[test]
    fn test_equal_score_keeps_incumbent() {
        let mut table = ArbitrationTable::new();
        offer(&mut table, key(1, 2), 10);
        assert_eq!(
            offer(&mut table, key(1, 3), 10),
            Arbitration::Reject {
                incumbent: ActiveSource {
                    sub_source: SubSourceId(2),
                    score: QualityScore(10)
                }
            }
        );
    }

    #[test]
    fn test_winner_may_reoffer_with_lower_score() {
        let mut table = ArbitrationTable::new();
        offer(&mut table, key(4, 0), 900);
        assert!(offer(&mut table, key(4, 0), 5).is_accepted());
        assert_eq!(table.get(SourceId(4)).map(|a| a.score), Some(QualityScore(5)));
    }

    #[test]
    fn test_arbitration_is_order_independent() {
        for (first, second) in [((0, 10), (1, 20)), ((1, 20), (0, 10))] {
            let mut table = ArbitrationTable::new();
            offer(&mut table, key(9, first.0), first.1);
            offer(&mut table, key(9, second.0), second.1);
            assert_eq!(table.get(SourceId(9)).map(|a| a.sub_source), Some(SubSourceId(1)));
        }
    }

    #[test]
    fn test_clear_if_winner_ignores_stale_sub_source() {
        let mut table = ArbitrationTable::new();
        offer(&mut table, key(5, 0), 1);
        offer(&mut table, key(5, 1), 2);
        assert!(!table.clear_if_winner(key(5, 0)));
        assert!(table.is_winner(key(5, 1)));
        assert!(table.clear_if_winner(key(5, 1)));
        assert!(table.get(SourceId(5)).is_none());
        assert!(table.admits(key(5, 0)));
    }
}
