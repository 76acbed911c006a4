//! Minimal RIFF/WAVE reader for fallback responses.
//!
//! Only the chunk structure is walked: `fmt ` is read for the format and the
//! `data` chunk is returned without copying. A `data` size larger than what was
//! received (streaming encoders write `0xFFFFFFFF`) is clamped to the body.

use bytes::Bytes;

use super::AudioFormat;
use crate::errors::{SpeechError, SpeechResult};

const RIFF_HEADER_LEN: usize = 12;
const CHUNK_HEADER_LEN: usize = 8;

/// PCM payload of a WAV container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavPayload {
    pub format: Option<AudioFormat>,
    pub pcm: Bytes,
}

/// Whether a response body is a WAV container rather than raw samples.
pub fn is_container(content_type: Option<&str>, body: &[u8]) -> bool {
    let declared = content_type
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.contains("audio/wav") || ct.contains("audio/x-wav") || ct.contains("audio/wave")
        })
        .unwrap_or(false);
    declared || has_riff_header(body)
}

fn has_riff_header(body: &[u8]) -> bool {
    body.len() >= RIFF_HEADER_LEN && &body[0..4] == b"RIFF" && &body[8..12] == b"WAVE"
}

/// Extract the `data` chunk from a WAV body.
///
/// # Errors
/// Returns [`SpeechError::DecodeError`] if the RIFF header is missing or no
/// `data` chunk is present.
pub fn parse(body: &Bytes) -> SpeechResult<WavPayload> {
    if !has_riff_header(body) {
        return Err(SpeechError::DecodeError(
            "missing RIFF/WAVE header".to_string(),
        ));
    }

    let mut format = None;
    let mut offset = RIFF_HEADER_LEN;

    while offset + CHUNK_HEADER_LEN <= body.len() {
        let id = &body[offset..offset + 4];
        let size = u32::from_le_bytes([
            body[offset + 4],
            body[offset + 5],
            body[offset + 6],
            body[offset + 7],
        ]) as usize;
        let start = offset + CHUNK_HEADER_LEN;
        let available = body.len() - start;

        if id == b"data" {
            let end = start + size.min(available);
            return Ok(WavPayload {
                format,
                pcm: body.slice(start..end),
            });
        }

        if id == b"fmt " && size >= 16 && available >= 16 {
            let field = |at: usize| u16::from_le_bytes([body[start + at], body[start + at + 1]]);
            let sample_rate = u32::from_le_bytes([
                body[start + 4],
                body[start + 5],
                body[start + 6],
                body[start + 7],
            ]);
            format = Some(AudioFormat {
                sample_rate,
                channels: field(2),
                bits_per_sample: field(14),
            });
        }

        // Chunks are word aligned.
        let padded = size.saturating_add(size & 1);
        offset = match start.checked_add(padded) {
            Some(next) => next,
            None => break,
        };
    }

    Err(SpeechError::DecodeError("no data chunk in WAV body".to_string()))
}
