//! Low-level audio decoding
//!
//! Used by the decode-buffer strategy and by the device sink.

use std::io::{Cursor, Read};

use crate::voice::sink::{AudioClip, DecodedAudio};
use crate::{Error, Result};

/// Whether the low-level decoder understands this clip
#[must_use]
pub fn can_decode(clip: &AudioClip) -> bool {
    is_wav(&clip.bytes) || is_mpeg_mime(&clip.mime) || looks_like_mp3(&clip.bytes)
}

/// Decode a clip to mono PCM, sniffing the container
///
/// # Errors
///
/// Returns error if the bytes are not decodable WAV or MP3
pub fn decode_clip(clip: &AudioClip) -> Result<DecodedAudio> {
    if clip.bytes.is_empty() {
        return Err(Error::Audio("empty audio payload".to_string()));
    }
    if is_wav(&clip.bytes) {
        decode_wav(&clip.bytes)
    } else {
        decode_mp3(&clip.bytes)
    }
}

/// Decode MP3 bytes to mono f32 samples
///
/// # Errors
///
/// Returns error if decoding fails
pub fn decode_mp3(mp3_data: &[u8]) -> Result<DecodedAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if sample_rate == 0 {
                    sample_rate = u32::try_from(frame.sample_rate).unwrap_or(0);
                }
                samples.extend(downmix(&frame.data, frame.channels));
            }
            Err(minimp3::Error::Eof) => break,
            Err(minimp3::Error::SkippedData) => {}
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    if samples.is_empty() || sample_rate == 0 {
        return Err(Error::Audio("no MP3 frames found".to_string()));
    }

    Ok(DecodedAudio {
        sample_rate,
        samples,
    })
}

/// Decode integer or float WAV bytes to mono f32 samples
///
/// # Errors
///
/// Returns error if the WAV header or samples are invalid
#[allow(clippy::cast_precision_loss)]
pub fn decode_wav(wav_data: &[u8]) -> Result<DecodedAudio> {
    let mut reader =
        hound::WavReader::new(Cursor::new(wav_data)).map_err(|e| Error::Audio(e.to_string()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Audio(e.to_string()))?,
        hound::SampleFormat::Int => {
            // Full scale for 8 through 32 bit integer samples
            let full_scale = (1_i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / full_scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Audio(e.to_string()))?
        }
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok(DecodedAudio {
        sample_rate: spec.sample_rate,
        samples,
    })
}

/// Convert f32 samples to 16-bit mono WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Interleaved i16 frames to mono f32
#[must_use]
pub fn downmix(data: &[i16], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.iter().map(|&s| f32::from(s) / 32768.0).collect();
    }

    #[allow(clippy::cast_precision_loss)]
    data.chunks(channels)
        .map(|frame| {
            let sum: f32 = frame.iter().map(|&s| f32::from(s) / 32768.0).sum();
            sum / frame.len() as f32
        })
        .collect()
}

/// Linear resampling between sample rates
#[must_use]
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = f64::from(from_rate) / f64::from(to_rate);
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let out_len = ((samples.len() as f64) / ratio).round() as usize;

    (0..out_len)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let position = i as f64 * ratio;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let index = position.floor() as usize;
            #[allow(clippy::cast_possible_truncation)]
            let fraction = (position - position.floor()) as f32;
            let current = samples.get(index).copied().unwrap_or(0.0);
            let next = samples.get(index + 1).copied().unwrap_or(current);
            (next - current).mul_add(fraction, current)
        })
        .collect()
}

/// Decodes an MP3 byte stream incrementally, frame by frame
///
/// The reader blocks for more input, so partial frames at chunk boundaries
/// are completed by the next chunk instead of being dropped.
pub struct StreamDecoder<R: Read> {
    decoder: minimp3::Decoder<R>,
}

impl<R: Read> StreamDecoder<R> {
    /// Wrap a blocking reader of MP3 bytes
    pub fn new(reader: R) -> Self {
        Self {
            decoder: minimp3::Decoder::new(reader),
        }
    }

    /// Next decoded frame, or `None` at end of stream
    ///
    /// # Errors
    ///
    /// Returns error if the stream is not valid MP3
    pub fn next_frame(&mut self) -> Result<Option<DecodedAudio>> {
        loop {
            match self.decoder.next_frame() {
                Ok(frame) => {
                    return Ok(Some(DecodedAudio {
                        sample_rate: u32::try_from(frame.sample_rate).unwrap_or(0),
                        samples: downmix(&frame.data, frame.channels),
                    }));
                }
                Err(minimp3::Error::Eof) => return Ok(None),
                Err(minimp3::Error::SkippedData) => {}
                Err(e) => return Err(Error::Audio(format!("MP3 stream decode error: {e}"))),
            }
        }
    }
}

fn is_wav(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

fn is_mpeg_mime(mime: &str) -> bool {
    let mime = mime.to_ascii_lowercase();
    mime.starts_with("audio/mpeg") || mime.starts_with("audio/mp3")
}

fn looks_like_mp3(bytes: &[u8]) -> bool {
    bytes.starts_with(b"ID3") || (bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0)
}
