//! PCM audio formats and chunks.
//!
//! All audio on a Live session is 16-bit little-endian PCM. Capture runs at
//! 16kHz and the service answers at 24kHz; the rate travels in the mime type
//! (`audio/pcm;rate=24000`).

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Mime type prefix for raw PCM audio.
pub const MIME_AUDIO_PCM: &str = "audio/pcm";

/// Sample rate accepted for audio sent to the service.
pub const INPUT_SAMPLE_RATE: u32 = 16000;

/// Sample rate of audio produced by the service.
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// 16-bit PCM format description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
}

impl AudioFormat {
    /// Creates a PCM16 format.
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Mono 16kHz, the capture format.
    pub const fn input() -> Self {
        Self::new(INPUT_SAMPLE_RATE, 1)
    }

    /// Mono 24kHz, the service output format.
    pub const fn output() -> Self {
        Self::new(OUTPUT_SAMPLE_RATE, 1)
    }

    /// Bytes per frame (one sample on every channel).
    pub fn frame_size(&self) -> usize {
        self.channels as usize * 2
    }

    /// Bytes per second.
    pub fn bytes_rate(&self) -> u64 {
        self.sample_rate as u64 * self.frame_size() as u64
    }

    /// Number of bytes covering `duration`, rounded down to whole frames.
    pub fn bytes_in_duration(&self, duration: Duration) -> usize {
        let frames = duration.as_nanos() * self.sample_rate as u128 / 1_000_000_000;
        frames as usize * self.frame_size()
    }

    /// Playback duration of `bytes` bytes.
    pub fn duration(&self, bytes: usize) -> Duration {
        let rate = self.bytes_rate();
        if rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((bytes as u128 * 1_000_000_000 / rate as u128) as u64)
    }

    /// Mime type for this format, e.g. `audio/pcm;rate=16000`.
    pub fn mime_type(&self) -> String {
        format!("{};rate={}", MIME_AUDIO_PCM, self.sample_rate)
    }

    /// Parses a PCM mime type. A missing rate defaults to the output rate.
    ///
    /// Returns `None` for non-PCM media.
    pub fn from_mime_type(mime: &str) -> Option<Self> {
        let mut params = mime.split(';').map(str::trim);
        let base = params.next()?;
        if !base.eq_ignore_ascii_case(MIME_AUDIO_PCM) {
            return None;
        }
        let mut format = Self::output();
        for param in params {
            if let Some((key, value)) = param.split_once('=') {
                match key.trim() {
                    "rate" => format.sample_rate = value.trim().parse().ok()?,
                    "channels" => format.channels = value.trim().parse().ok()?,
                    _ => {}
                }
            }
        }
        Some(format)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pcm16/{}hz/{}ch", self.sample_rate, self.channels)
    }
}

/// A unit of PCM audio.
///
/// The payload is reference counted so the same chunk can be handed to
/// `audio` subscribers and to the playback scheduler without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    format: AudioFormat,
    data: Bytes,
}

impl AudioChunk {
    /// Creates a chunk, rejecting payloads that are not whole frames.
    pub fn new(format: AudioFormat, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        if format.frame_size() == 0 || data.len() % format.frame_size() != 0 {
            return Err(Error::audio(format!(
                "{} bytes is not a whole number of {} frames",
                data.len(),
                format
            )));
        }
        Ok(Self { format, data })
    }

    /// Creates a chunk from i16 samples.
    pub fn from_samples(format: AudioFormat, samples: &[i16]) -> Result<Self> {
        let mut data = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        Self::new(format, data)
    }

    /// Returns the audio format.
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Returns the raw little-endian bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Returns the payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the chunk carries no samples.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the playback duration.
    pub fn duration(&self) -> Duration {
        self.format.duration(self.data.len())
    }

    /// Decodes the payload into i16 samples.
    pub fn samples(&self) -> Vec<i16> {
        self.data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }
}
