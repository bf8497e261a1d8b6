//! # Revoice Common Library
//!
//! Shared code for the Revoice retargeting service:
//! - Error taxonomy (flat `Error` enum with stable reason codes)
//! - Domain types (transcreations, transcript segments, job envelopes)
//! - Event types (`RetargetEvent` enum) and the broadcast `EventBus`
//! - Configuration loading
//! - Time helpers (millisecond/second boundary conversions)

pub mod config;
pub mod error;
pub mod events;
pub mod time;
pub mod types;

pub use config::Settings;
pub use error::{Error, Result};
pub use events::{EventBus, RetargetEvent};
pub use types::{
    JobEnvelope, JobState, ProgressUpdate, Transcreation, TranscriptSegment, TtsRequestSpec,
    VoiceChoice, CLONE_VOICE, DEFAULT_LANGUAGE,
};
