//! Opus <-> PCM framing at the fixed 16 kHz/mono profile (§4.1).
//!
//! One [`FrameCodec`] is owned per session. Decode failures are recoverable:
//! the caller drops the frame and bumps a counter rather than tearing the
//! session down (§7).

use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Channels, SampleRate};

use crate::error::CodecError;

/// Opus packets larger than this are rejected outright rather than handed
/// to libopus (a legitimate 60 ms packet never approaches this size).
const MAX_PACKET_BYTES: usize = 4000;

fn sample_rate() -> SampleRate {
    SampleRate::Hz16000
}

/// Decodes inbound Opus packets and encodes outbound PCM at the
/// negotiated frame size. A zero-length input frame is the end-of-stream
/// sentinel and is handled by the caller, not the codec.
pub struct FrameCodec {
    decoder: Decoder,
    encoder: Encoder,
    frame_size: usize,
    decode_errors: u64,
}

impl FrameCodec {
    /// `frame_size` is in samples (960 for the canonical 60 ms profile).
    pub fn new(frame_size: usize) -> Result<Self, CodecError> {
        let decoder = Decoder::new(sample_rate(), Channels::Mono)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        let encoder = Encoder::new(sample_rate(), Channels::Mono, Application::Voip)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Self { decoder, encoder, frame_size, decode_errors: 0 })
    }

    /// Decodes one Opus packet into exactly `frame_size` signed 16-bit PCM
    /// samples. A malformed packet is reported but does not panic; the
    /// caller decides whether to drop it and continue.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, CodecError> {
        if packet.len() > MAX_PACKET_BYTES {
            self.decode_errors += 1;
            return Err(CodecError::InvalidLength(packet.len()));
        }
        let mut output = vec![0i16; self.frame_size];
        match self.decoder.decode(Some(packet), &mut output, false) {
            Ok(written) => {
                output.truncate(written);
                if written < self.frame_size {
                    output.resize(self.frame_size, 0);
                }
                Ok(output)
            }
            Err(e) => {
                self.decode_errors += 1;
                Err(CodecError::Decode(e.to_string()))
            }
        }
    }

    /// Packet-loss concealment: synthesize a plausible frame for a frame
    /// the network dropped, rather than inserting silence.
    pub fn decode_plc(&mut self) -> Result<Vec<i16>, CodecError> {
        let mut output = vec![0i16; self.frame_size];
        let written = self
            .decoder
            .decode(None, &mut output, false)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        output.truncate(written);
        Ok(output)
    }

    /// Encodes a PCM block into one Opus packet. A block shorter than
    /// `frame_size` is zero-padded first (documented lossy tail policy,
    /// §4.1) rather than rejected.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        let mut padded;
        let input: &[i16] = if pcm.len() == self.frame_size {
            pcm
        } else if pcm.len() < self.frame_size {
            padded = pcm.to_vec();
            padded.resize(self.frame_size, 0);
            &padded
        } else {
            return Err(CodecError::InvalidLength(pcm.len()));
        };

        let mut output = vec![0u8; MAX_PACKET_BYTES];
        let written = self
            .encoder
            .encode(input, &mut output)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        output.truncate(written);
        Ok(output)
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn decode_error_count(&self) -> u64 {
        self.decode_errors
    }
}
