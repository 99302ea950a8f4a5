//! Capture agent.
//!
//! One agent runs per page context (tab or frame). It turns the media its
//! producer finds into exactly one outbound session at a time and rebuilds
//! that session whenever the media or the connection goes away.

#![forbid(unsafe_code)]

pub mod agent;
pub mod producer;

pub use agent::{AgentHandle, AgentPhase, AgentStatus, CaptureAgent};
pub use producer::{CapturedMedia, MediaProducer, VideoSignal};
