//! Audio decoding module
//!
//! Uses symphonia for decoding multiple formats:
//! - WAV, AIFF (PCM)
//! - FLAC, ALAC (lossless)
//! - MP3, OGG Vorbis, AAC/M4A (lossy)

use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Serialize;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::buffer::AudioBuffer;
use crate::error::{OfflineError, OfflineResult};

/// Universal audio decoder using symphonia
pub struct AudioDecoder;

impl AudioDecoder {
    fn open(path: &Path) -> OfflineResult<Box<dyn FormatReader>> {
        if !path.exists() {
            return Err(OfflineError::InputNotFound(path.display().to_string()));
        }
        let file = File::open(path)
            .map_err(|e| OfflineError::ReadError(format!("Failed to open file: {}", e)))?;

        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        // Create hint from file extension
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| OfflineError::ReadError(format!("Failed to probe format: {}", e)))?;

        Ok(probed.format)
    }

    /// Decode the first audio track of a file to interleaved f32
    pub fn decode(path: &Path) -> OfflineResult<AudioBuffer> {
        let mut format = Self::open(path)?;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| OfflineError::ReadError("No audio track found".to_string()))?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();
        let mut sample_rate = codec_params.sample_rate.unwrap_or(44100);
        let mut channels = codec_params.channels.map(|c| c.count()).unwrap_or(0);

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| OfflineError::ReadError(format!("Failed to create decoder: {}", e)))?;

        let mut samples: Vec<f32> = Vec::new();
        let mut scratch: Option<SampleBuffer<f32>> = None;
        let mut skipped = 0usize;

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => {
                    return Err(OfflineError::ReadError(format!("Packet read error: {}", e)));
                }
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(msg)) => {
                    skipped += 1;
                    log::warn!("Skipping corrupt packet in {}: {}", path.display(), msg);
                    continue;
                }
                Err(e) => {
                    return Err(OfflineError::ReadError(format!("Decode error: {}", e)));
                }
            };

            let spec = *decoded.spec();
            if channels == 0 {
                channels = spec.channels.count();
            }
            sample_rate = spec.rate;

            let needed = decoded.capacity() * spec.channels.count();
            if scratch.as_ref().is_none_or(|buf| buf.capacity() < needed) {
                scratch = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
            }
            if let Some(buf) = scratch.as_mut() {
                buf.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buf.samples());
            }
        }

        if channels == 0 {
            return Err(OfflineError::ReadError("Stream has no channels".to_string()));
        }
        if skipped > 0 {
            log::warn!("{} packets could not be decoded in {}", skipped, path.display());
        }

        log::debug!(
            "Decoded {}: {} frames, {} ch, {} Hz",
            path.display(),
            samples.len() / channels,
            channels,
            sample_rate
        );

        Ok(AudioBuffer {
            samples,
            channels,
            sample_rate,
        })
    }

    /// Get audio file info without decoding
    pub fn probe(path: &Path) -> OfflineResult<AudioFileInfo> {
        let format = Self::open(path)?;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| OfflineError::ReadError("No audio track found".to_string()))?;

        let codec_params = &track.codec_params;

        let sample_rate = codec_params.sample_rate.unwrap_or(44100);
        let channels = codec_params.channels.map(|c| c.count()).unwrap_or(2);
        let bit_depth = codec_params.bits_per_sample.unwrap_or(16);

        let duration = codec_params
            .n_frames
            .map(|f| f as f64 / sample_rate as f64)
            .unwrap_or(0.0);

        let format_name = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("unknown")
            .to_uppercase();

        Ok(AudioFileInfo {
            path: path.to_path_buf(),
            format: format_name,
            sample_rate,
            channels,
            bit_depth: bit_depth as u8,
            duration,
            frames: codec_params.n_frames.unwrap_or(0),
        })
    }

    /// Get list of supported formats
    pub fn supported_formats() -> &'static [&'static str] {
        &["wav", "flac", "mp3", "ogg", "aac", "m4a", "aiff", "aif"]
    }
}

/// Audio file information
#[derive(Debug, Clone, Serialize)]
pub struct AudioFileInfo {
    pub path: PathBuf,
    pub format: String,
    pub sample_rate: u32,
    pub channels: usize,
    pub bit_depth: u8,
    pub duration: f64,
    pub frames: u64,
}

impl AudioFileInfo {
    /// Get duration as formatted string
    pub fn duration_str(&self) -> String {
        let total_secs = self.duration as u64;
        let hours = total_secs / 3600;
        let mins = (total_secs % 3600) / 60;
        let secs = total_secs % 60;
        let ms = ((self.duration - total_secs as f64) * 1000.0).round() as u64;

        if hours > 0 {
            format!("{}:{:02}:{:02}.{:03}", hours, mins, secs, ms)
        } else {
            format!("{}:{:02}.{:03}", mins, secs, ms)
        }
    }
}
