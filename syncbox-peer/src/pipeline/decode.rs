//! Audio decode backend
//!
//! Turns a local file into an in-memory buffer of interleaved stereo f32
//! samples. Decoding is synchronous and CPU bound; the pipeline runs it on
//! the blocking thread pool.

use crate::error::{Error, Result};
use std::path::Path;
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// Fully decoded audio, ready to play
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    /// Interleaved stereo samples [L, R, L, R, ...]
    samples: Vec<f32>,
    /// Native sample rate of the source
    sample_rate: u32,
    /// Channel count of the source before stereo conversion
    source_channels: u16,
}

impl DecodedAudio {
    /// Wrap interleaved stereo samples
    pub fn new(samples: Vec<f32>, sample_rate: u32, source_channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            source_channels,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn source_channels(&self) -> u16 {
        self.source_channels
    }

    /// Number of stereo frames
    pub fn frames(&self) -> usize {
        self.samples.len() / 2
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration().as_millis() as u64
    }
}

/// Decode backend
pub trait AudioDecoder: Send + Sync {
    /// Decode the whole file at `path`
    fn decode(&self, path: &Path) -> Result<DecodedAudio>;
}

/// Decoder backed by symphonia
///
/// Supports the formats enabled in Cargo.toml (MP3, FLAC, AAC, MP4/M4A,
/// Vorbis, WAV). Mono sources are duplicated to stereo, multi-channel
/// sources are folded down.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaDecoder;

impl AudioDecoder for SymphoniaDecoder {
    fn decode(&self, path: &Path) -> Result<DecodedAudio> {
        debug!("Decoding entire file: {}", path.display());

        let file = std::fs::File::open(path)
            .map_err(|e| Error::Decode(format!("Failed to open file {}: {}", path.display(), e)))?;

        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        // Extension hint helps the probe guess the container
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| Error::Decode(format!("Failed to probe format: {}", e)))?;

        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::Decode("No audio track found".to_string()))?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| Error::Decode("Sample rate not found".to_string()))?;
        let mut source_channels = codec_params.channels.map(|c| c.count() as u16).unwrap_or(0);

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| Error::Decode(format!("Failed to create decoder: {}", e)))?;

        let mut samples = Vec::new();

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => {
                    return Err(Error::Decode(format!("Failed to read packet: {}", e)));
                }
            };

            if packet.track_id() != track_id {
                continue;
            }

            match decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let channels = spec.channels.count();
                    source_channels = channels as u16;

                    let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    buffer.copy_interleaved_ref(decoded);
                    append_as_stereo(&mut samples, buffer.samples(), channels);
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    // Corrupt packet: skip it, keep the rest of the stream
                    warn!("Skipping undecodable packet: {}", e);
                }
                Err(e) => {
                    return Err(Error::Decode(format!("Decoder failed: {}", e)));
                }
            }
        }

        if samples.is_empty() {
            return Err(Error::Decode(format!(
                "No audio decoded from {}",
                path.display()
            )));
        }

        let audio = DecodedAudio::new(samples, sample_rate, source_channels);
        debug!(
            "Decoded {} frames at {} Hz ({} source channels, {} ms)",
            audio.frames(),
            sample_rate,
            source_channels,
            audio.duration_ms()
        );

        Ok(audio)
    }
}

/// Append interleaved samples with `channels` channels as stereo
fn append_as_stereo(output: &mut Vec<f32>, interleaved: &[f32], channels: usize) {
    match channels {
        0 => {}
        1 => {
            output.reserve(interleaved.len() * 2);
            for &sample in interleaved {
                output.push(sample);
                output.push(sample);
            }
        }
        2 => output.extend_from_slice(interleaved),
        _ => {
            // Even channels fold into left, odd into right
            let per_side = (channels as f32 / 2.0).max(1.0);
            output.reserve(interleaved.len() / channels * 2);
            for frame in interleaved.chunks_exact(channels) {
                let (mut left, mut right) = (0.0f32, 0.0f32);
                for (idx, sample) in frame.iter().enumerate() {
                    if idx % 2 == 0 {
                        left += sample;
                    } else {
                        right += sample;
                    }
                }
                output.push(left / per_side);
                output.push(right / per_side);
            }
        }
    }
}
