//! Fixed 16 kHz/mono audio plumbing: Opus framing, voice-activity
//! detection, and the per-utterance PCM ring.

pub mod buffer;
pub mod codec;
pub mod constants;
pub mod vad;

pub use buffer::AudioBuffer;
pub use codec::FrameCodec;
pub use vad::{RmsThresholdVad, VadEdge, VoiceActivityDetector};
