//! # Audio Processing and Validation
//!
//! Helpers for the PCM audio that clients stream to the relay:
//! - **Decoding**: clients send base64 text frames, the upstream wants bytes
//! - **Validation**: 16-bit little-endian mono PCM at 16 kHz
//! - **Measurement**: duration of a byte count, peak amplitude
//! - **Framing**: wrap raw PCM in a WAV header for the batch transcription call

use crate::error::{AppError, AppResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Write};

/// Audio format the relay accepts and forwards upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            bit_depth: 16,
        }
    }
}

impl AudioFormat {
    pub fn bytes_per_second(&self) -> u32 {
        self.sample_rate * self.channels as u32 * (self.bit_depth as u32 / 8)
    }

    fn block_align(&self) -> u16 {
        self.channels * (self.bit_depth / 8)
    }
}

/// Audio validation and conversion utilities.
#[derive(Debug, Clone, Default)]
pub struct AudioProcessor {
    format: AudioFormat,
    /// Largest decoded chunk accepted from a client, in bytes
    max_chunk_bytes: usize,
}

impl AudioProcessor {
    pub fn new(format: AudioFormat, max_chunk_bytes: usize) -> Self {
        Self {
            format,
            max_chunk_bytes,
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Decode a client `audioData` payload and validate it.
    ///
    /// ## Returns:
    /// - **Ok(bytes)**: raw PCM16 ready to forward
    /// - **Err(Validation)**: not base64, empty, odd length or oversized
    pub fn decode_chunk(&self, encoded: &str) -> AppResult<Vec<u8>> {
        let bytes = STANDARD.decode(encoded.trim())?;
        self.validate_audio_data(&bytes)?;
        Ok(bytes)
    }

    /// Validate the structure of a PCM16 chunk.
    ///
    /// Silence is legitimate mid-stream (the upstream VAD relies on it), so
    /// unlike a one-shot upload there is no dynamic range check here.
    pub fn validate_audio_data(&self, data: &[u8]) -> AppResult<()> {
        if data.is_empty() {
            return Err(AppError::Validation("Audio data is empty".to_string()));
        }

        let sample_bytes = self.format.block_align() as usize;
        if data.len() % sample_bytes != 0 {
            return Err(AppError::Validation(format!(
                "Audio data length {} is not a multiple of {} bytes",
                data.len(),
                sample_bytes
            )));
        }

        if self.max_chunk_bytes > 0 && data.len() > self.max_chunk_bytes {
            return Err(AppError::Validation(format!(
                "Audio chunk of {} bytes exceeds the {} byte limit",
                data.len(),
                self.max_chunk_bytes
            )));
        }

        Ok(())
    }

    /// Playback duration of `byte_len` bytes of PCM in this format.
    pub fn duration_secs(&self, byte_len: usize) -> f64 {
        byte_len as f64 / self.format.bytes_per_second() as f64
    }

    /// Largest absolute sample value, used for debug logging of chunk levels.
    pub fn peak_amplitude(&self, data: &[u8]) -> u16 {
        let mut cursor = Cursor::new(data);
        let mut peak = 0u16;
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            peak = peak.max(sample.unsigned_abs());
        }
        peak
    }

    /// Concatenate chunk payloads in the given order.
    pub fn concat<'a, I>(&self, payloads: I) -> Vec<u8>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        payloads.into_iter().flatten().copied().collect()
    }

    /// Wrap raw PCM in a canonical 44-byte RIFF/WAVE header.
    pub fn wrap_wav(&self, pcm: &[u8]) -> AppResult<Vec<u8>> {
        let data_len = u32::try_from(pcm.len())
            .map_err(|_| AppError::Validation("audio too long for a WAV container".to_string()))?;
        let mut wav = Vec::with_capacity(44 + pcm.len());

        // std::io::Write on Vec<u8> cannot fail
        let write = |wav: &mut Vec<u8>| -> std::io::Result<()> {
            wav.write_all(b"RIFF")?;
            wav.write_u32::<LittleEndian>(36 + data_len)?;
            wav.write_all(b"WAVE")?;
            wav.write_all(b"fmt ")?;
            wav.write_u32::<LittleEndian>(16)?;
            wav.write_u16::<LittleEndian>(1)?; // PCM
            wav.write_u16::<LittleEndian>(self.format.channels)?;
            wav.write_u32::<LittleEndian>(self.format.sample_rate)?;
            wav.write_u32::<LittleEndian>(self.format.bytes_per_second())?;
            wav.write_u16::<LittleEndian>(self.format.block_align())?;
            wav.write_u16::<LittleEndian>(self.format.bit_depth)?;
            wav.write_all(b"data")?;
            wav.write_u32::<LittleEndian>(data_len)?;
            wav.write_all(pcm)
        };
        write(&mut wav).map_err(|e| AppError::Internal(format!("WAV framing failed: {}", e)))?;
        Ok(wav)
    }
}
