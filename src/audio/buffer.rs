//! Bounded per-utterance PCM ring (§4.3).
//!
//! Single-writer (ingest), single-reader (the pipeline once finalized).
//! Append is O(1) amortized; overflow forces an early, truncated finalize
//! rather than growing unbounded.

/// A finalized utterance buffer, ready to hand to STT.
pub struct FinalizedAudio {
    pub pcm: Vec<i16>,
    pub truncated: bool,
}

pub struct AudioBuffer {
    samples: Vec<i16>,
    capacity_samples: usize,
    truncated: bool,
}

impl AudioBuffer {
    /// `capacity_samples` is the max-duration policy from §3 (e.g. 30s at
    /// 16kHz = 480_000 samples).
    pub fn new(capacity_samples: usize) -> Self {
        Self { samples: Vec::new(), capacity_samples, truncated: false }
    }

    /// Appends one decoded PCM frame. Returns `true` if this append pushed
    /// the buffer over capacity (the caller should finalize immediately).
    pub fn append(&mut self, pcm: &[i16]) -> bool {
        if self.truncated {
            return true;
        }
        let remaining = self.capacity_samples.saturating_sub(self.samples.len());
        if pcm.len() <= remaining {
            self.samples.extend_from_slice(pcm);
            false
        } else {
            self.samples.extend_from_slice(&pcm[..remaining]);
            self.truncated = true;
            true
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.truncated
    }

    /// Consumes the buffer and returns a contiguous view for STT.
    pub fn finalize(self) -> FinalizedAudio {
        FinalizedAudio { pcm: self.samples, truncated: self.truncated }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_below_capacity_does_not_truncate() {
        let mut buf = AudioBuffer::new(1000);
        assert!(!buf.append(&vec![1i16; 500]));
        assert_eq!(buf.len(), 500);
        assert!(!buf.is_full());
    }

    #[test]
    fn overflow_at_exactly_capacity_forces_truncated_finalize() {
        let mut buf = AudioBuffer::new(1000);
        assert!(!buf.append(&vec![1i16; 900]));
        assert!(buf.append(&vec![1i16; 200])); // pushes past capacity
        assert!(buf.is_full());
        let finalized = buf.finalize();
        assert!(finalized.truncated);
        assert_eq!(finalized.pcm.len(), 1000);
    }

    #[test]
    fn empty_utterance_finalizes_to_empty_pcm() {
        let buf = AudioBuffer::new(1000);
        let finalized = buf.finalize();
        assert!(finalized.pcm.is_empty());
        assert!(!finalized.truncated);
    }

    #[test]
    fn appends_after_truncation_are_no_ops() {
        let mut buf = AudioBuffer::new(100);
        buf.append(&vec![1i16; 100]);
        assert!(buf.is_full());
        assert!(buf.append(&vec![1i16; 50]));
        assert_eq!(buf.len(), 100);
    }
}
