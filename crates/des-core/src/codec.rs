//! Telemetry Codec.
//!
//! A sample travels as a fixed 40-byte little-endian frame:
//!
//! ```text
//! offset  size  field
//!      0     8  time (i64, unix millis)
//!      8     4  ch4 (f32)
//!     12     4  hi_flow (f32)
//!     16     4  lo_flow (f32)
//!     20     4  press (f32)
//!     24     4  bat_amp (f32)
//!     28     4  bat_volt (f32)
//!     32     4  mot_volt (f32)
//!     36     2  vlv_tgt (u16)
//!     38     2  vlv_pos (u16)
//! ```
//!
//! The transport form is URL-safe base64 so payloads never need escaping.
//! Several frames may be concatenated in one text payload.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use thiserror::Error;

use crate::models::SampleRecord;

/// Size of one encoded frame in bytes.
pub const FRAME_LEN: usize = 40;

/// URL-safe alphabet; padded on encode, padding optional on decode.
const TEXT_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed frame: {len} bytes, expected {expected}")]
    MalformedFrame { len: usize, expected: usize },

    #[error("invalid transport text: {0}")]
    InvalidText(String),
}

/// Encode one sample into its binary frame. The job tag is not part of the frame.
pub fn encode(sample: &SampleRecord) -> [u8; FRAME_LEN] {
    let mut buf = [0u8; FRAME_LEN];
    buf[0..8].copy_from_slice(&sample.time.to_le_bytes());
    let floats = [
        sample.ch4,
        sample.hi_flow,
        sample.lo_flow,
        sample.press,
        sample.bat_amp,
        sample.bat_volt,
        sample.mot_volt,
    ];
    for (i, v) in floats.iter().enumerate() {
        let at = 8 + i * 4;
        buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }
    buf[36..38].copy_from_slice(&sample.vlv_tgt.to_le_bytes());
    buf[38..40].copy_from_slice(&sample.vlv_pos.to_le_bytes());
    buf
}

/// Decode the first frame of `buf`.
///
/// Buffers shorter than [`FRAME_LEN`] are rejected. The returned sample has
/// an empty job tag.
pub fn decode(buf: &[u8]) -> Result<SampleRecord, CodecError> {
    let frame: &[u8; FRAME_LEN] = buf
        .get(..FRAME_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or(CodecError::MalformedFrame {
            len: buf.len(),
            expected: FRAME_LEN,
        })?;

    let f32_at = |at: usize| f32::from_le_bytes([frame[at], frame[at + 1], frame[at + 2], frame[at + 3]]);
    let u16_at = |at: usize| u16::from_le_bytes([frame[at], frame[at + 1]]);

    let mut time = [0u8; 8];
    time.copy_from_slice(&frame[0..8]);

    Ok(SampleRecord {
        time: i64::from_le_bytes(time),
        ch4: f32_at(8),
        hi_flow: f32_at(12),
        lo_flow: f32_at(16),
        press: f32_at(20),
        bat_amp: f32_at(24),
        bat_volt: f32_at(28),
        mot_volt: f32_at(32),
        vlv_tgt: u16_at(36),
        vlv_pos: u16_at(38),
        job_name: String::new(),
    })
}

/// Decode a buffer holding one or more whole frames.
pub fn decode_all(buf: &[u8]) -> Result<Vec<SampleRecord>, CodecError> {
    if buf.is_empty() || buf.len() % FRAME_LEN != 0 {
        return Err(CodecError::MalformedFrame {
            len: buf.len(),
            expected: FRAME_LEN,
        });
    }
    buf.chunks_exact(FRAME_LEN).map(decode).collect()
}

pub fn to_text(bytes: &[u8]) -> String {
    TEXT_ENGINE.encode(bytes)
}

pub fn from_text(text: &str) -> Result<Vec<u8>, CodecError> {
    TEXT_ENGINE
        .decode(text.trim())
        .map_err(|e| CodecError::InvalidText(e.to_string()))
}

/// Encode a sample straight to its transport text.
pub fn encode_text(sample: &SampleRecord) -> String {
    to_text(&encode(sample))
}

/// Decode transport text holding one or more frames.
pub fn decode_text(text: &str) -> Result<Vec<SampleRecord>, CodecError> {
    decode_all(&from_text(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SampleRecord {
        SampleRecord {
            time: 1_700_000_000_123,
            ch4: 97.5,
            hi_flow: 12.25,
            lo_flow: 0.5,
            press: 1234.5,
            bat_amp: 0.75,
            bat_volt: 12.6,
            mot_volt: 11.9,
            vlv_tgt: 2,
            vlv_pos: 3,
            job_name: "DEMO42_1700000000000".to_string(),
        }
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode(&sample());
        assert_eq!(frame.len(), FRAME_LEN);
        assert_eq!(&frame[0..8], &1_700_000_000_123i64.to_le_bytes());
        assert_eq!(&frame[8..12], &97.5f32.to_le_bytes());
        assert_eq!(&frame[36..38], &2u16.to_le_bytes());
        assert_eq!(&frame[38..40], &3u16.to_le_bytes());
    }

    #[test]
    fn test_decode_drops_job_tag() {
        let decoded = decode(&encode(&sample())).unwrap();
        assert_eq!(decoded.job_name, "");
        assert_eq!(decoded.time, sample().time);
        assert_eq!(decoded.press, sample().press);
    }

    #[test]
    fn test_short_buffer_is_malformed() {
        let frame = encode(&sample());
        assert_eq!(
            decode(&frame[..39]),
            Err(CodecError::MalformedFrame {
                len: 39,
                expected: FRAME_LEN
            })
        );
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn test_decode_all_rejects_partial_frames() {
        let mut buf = encode(&sample()).to_vec();
        buf.extend_from_slice(&encode(&sample()));
        assert_eq!(decode_all(&buf).unwrap().len(), 2);
        buf.push(0);
        assert!(decode_all(&buf).is_err());
    }

    #[test]
    fn test_text_is_url_safe() {
        let mut s = sample();
        // Bytes that map to '+' and '/' in the standard alphabet.
        s.time = -1;
        s.vlv_tgt = u16::MAX;
        let text = encode_text(&s);
        assert!(!text.contains('+'));
        assert!(!text.contains('/'));
        let decoded = decode_text(&text).unwrap();
        assert_eq!(decoded[0].time, -1);
        assert_eq!(decoded[0].vlv_tgt, u16::MAX);
    }

    #[test]
    fn test_text_padding_optional() {
        let text = encode_text(&sample());
        let unpadded = text.trim_end_matches('=');
        assert_eq!(decode_text(unpadded).unwrap().len(), 1);
        assert!(matches!(
            decode_text("not base64!"),
            Err(CodecError::InvalidText(_))
        ));
    }
}
