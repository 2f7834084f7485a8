//! Voice Activity Detection (§4.2).
//!
//! Pure with respect to session state: the detector only classifies PCM
//! and emits edges. `SessionKernel` is the one that maps those edges onto
//! listen-state transitions. `manual` listen mode bypasses this module
//! entirely in favor of the client's explicit `listen:start`/`listen:stop`.

use crate::config::VadSettings;

/// An edge the detector observed on this tick, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEdge {
    SpeechStart,
    SpeechEnd,
}

/// Runtime-swappable VAD algorithm. The kernel only depends on this trait,
/// never on a concrete detector, so a production deployment can drop in an
/// ML-based classifier without touching session code.
pub trait VoiceActivityDetector: Send {
    /// Feed one frame of PCM (native frame size) and get back an edge if
    /// the speech/silence state flipped on this tick.
    fn tick(&mut self, pcm: &[i16]) -> Option<VadEdge>;

    /// True if the detector currently believes speech is in progress.
    fn is_speaking(&self) -> bool;

    /// Reset to the idle/silent state (used when a new utterance begins).
    fn reset(&mut self);
}

/// Energy-threshold VAD with a hangover window, per §4.2. Cannot
/// distinguish speech from other loud sound; it is the always-available
/// baseline, the same role `RmsThresholdVAD` plays in the wider voice
/// stack this gateway's kernel was adapted from.
pub struct RmsThresholdVad {
    threshold: f32,
    hangover_frames: u32,
    frame_duration_ms: u32,
    speaking: bool,
    silence_run: u32,
}

impl RmsThresholdVad {
    pub fn new(settings: &VadSettings, frame_duration_ms: u32) -> Self {
        let hangover_frames =
            ((settings.hangover_ms as f64 / frame_duration_ms as f64).ceil() as u32).max(1);
        Self {
            threshold: settings.energy_threshold,
            hangover_frames,
            frame_duration_ms,
            speaking: false,
            silence_run: 0,
        }
    }

    fn normalized_rms(samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_squares: f64 = samples.iter().map(|&s| (s as f64 / i16::MAX as f64).powi(2)).sum();
        ((sum_squares / samples.len() as f64).sqrt()) as f32
    }
}

impl VoiceActivityDetector for RmsThresholdVad {
    fn tick(&mut self, pcm: &[i16]) -> Option<VadEdge> {
        let above = Self::normalized_rms(pcm) >= self.threshold;

        if above {
            self.silence_run = 0;
            if !self.speaking {
                self.speaking = true;
                return Some(VadEdge::SpeechStart);
            }
            None
        } else {
            if !self.speaking {
                return None;
            }
            self.silence_run += 1;
            if self.silence_run >= self.hangover_frames {
                self.speaking = false;
                self.silence_run = 0;
                return Some(VadEdge::SpeechEnd);
            }
            None
        }
    }

    fn is_speaking(&self) -> bool {
        self.speaking
    }

    fn reset(&mut self) {
        self.speaking = false;
        self.silence_run = 0;
    }
}

impl RmsThresholdVad {
    pub fn frame_duration_ms(&self) -> u32 {
        self.frame_duration_ms
    }
}
