//! Aggregator.
//!
//! Accepts one inbound session per capture agent, keeps exactly one winning
//! session per source (tab) and exposes the winner's stream to the
//! presentation layer. A reconciliation loop re-requests capture for every
//! selected source that has no live stream.

#![forbid(unsafe_code)]

pub mod aggregator;
pub mod arbitration;
pub mod presentation;
pub mod selection;

pub use aggregator::{mailbox, Aggregator, AggregatorHandle, OfferOutcome};
pub use arbitration::{ActiveSource, Arbitration, ArbitrationTable};
pub use presentation::{ChannelSink, ExposedStream, PresentationSink, PresentationUpdate};
pub use selection::{JsonFileSelection, MemorySelection, SelectionStore};
