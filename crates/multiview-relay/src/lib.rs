//! Signaling relay.
//!
//! The relay remembers one thing: where the aggregator can be reached. Every
//! other envelope is forwarded and forgotten, so the relay can restart at any
//! time without corrupting in-flight sessions.

#![forbid(unsafe_code)]

pub mod host;
pub mod relay;

pub use host::{capture_with_recovery, AgentHost, CaptureOutcome, Injector, LocalAgentHost};
pub use relay::{AgentPort, AggregatorAddress, AggregatorPort, Relay, RelayCommand, RelayHandle};
