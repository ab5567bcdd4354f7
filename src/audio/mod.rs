//! # Audio Module
//!
//! Everything the relay does with raw microphone audio before it reaches the
//! speech service.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers, base64 on the client socket

pub mod buffer; // TTL chunk store for batch sessions
pub mod processor; // Decoding, validation, WAV framing
pub mod session; // Per-performance session record
