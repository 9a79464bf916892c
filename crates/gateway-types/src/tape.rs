use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `b"ZKTP"` read as a little-endian u32.
pub const TAPE_MAGIC: u32 = 0x5A4B_5450;
pub const TAPE_VERSION: u32 = 1;

pub const TAPE_HEADER_BYTES: usize = 16;
pub const TAPE_FOOTER_BYTES: usize = 12;

/// Metadata extracted from a validated tape.
///
/// All fields are read verbatim from the tape header and footer; the
/// checksum has already been verified against the tape contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeMetadata {
    pub seed: u32,
    pub frame_count: u32,
    pub final_score: u32,
    pub final_rng_state: u32,
    pub checksum: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TapeError {
    #[error("tape is empty")]
    Empty,
    #[error("tape is {len} bytes, limit is {limit}")]
    TooLarge { len: usize, limit: usize },
    #[error("tape is {len} bytes, shorter than the minimum of {min}")]
    Truncated { len: usize, min: usize },
    #[error("bad tape magic {found:#010x}, expected {TAPE_MAGIC:#010x}")]
    BadMagic { found: u32 },
    #[error("unsupported tape version {found}, expected {TAPE_VERSION}")]
    BadVersion { found: u32 },
    #[error("tape declares {frame_count} frames but is {len} bytes, expected {expected}")]
    LengthMismatch {
        frame_count: u32,
        len: usize,
        expected: usize,
    },
    #[error("tape checksum mismatch: footer says {footer:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { footer: u32, computed: u32 },
    #[error("zero-score tapes are not accepted")]
    ZeroScore,
}

impl TapeError {
    /// Stable machine-readable code surfaced to HTTP clients.
    pub fn code(&self) -> &'static str {
        match self {
            TapeError::Empty => "tape_empty",
            TapeError::TooLarge { .. } => "tape_too_large",
            TapeError::ZeroScore => "zero_score_not_allowed",
            _ => "tape_malformed",
        }
    }
}

fn read_u32_le(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

/// Validate a raw tape and extract its metadata.
///
/// Layout: 16-byte header (magic, version, seed, frame_count, all u32 LE),
/// `frame_count` single-byte frames, 12-byte footer (final_score,
/// final_rng_state, checksum). The checksum is CRC-32 over header + body.
/// Zero-score tapes are rejected last so malformed tapes report the more
/// specific error.
pub fn validate_tape(bytes: &[u8], max_bytes: usize) -> Result<TapeMetadata, TapeError> {
    if bytes.is_empty() {
        return Err(TapeError::Empty);
    }
    if bytes.len() > max_bytes {
        return Err(TapeError::TooLarge {
            len: bytes.len(),
            limit: max_bytes,
        });
    }
    let min = TAPE_HEADER_BYTES + TAPE_FOOTER_BYTES;
    if bytes.len() < min {
        return Err(TapeError::Truncated {
            len: bytes.len(),
            min,
        });
    }

    let magic = read_u32_le(bytes, 0);
    if magic != TAPE_MAGIC {
        return Err(TapeError::BadMagic { found: magic });
    }
    let version = read_u32_le(bytes, 4);
    if version != TAPE_VERSION {
        return Err(TapeError::BadVersion { found: version });
    }

    let seed = read_u32_le(bytes, 8);
    let frame_count = read_u32_le(bytes, 12);
    let expected = TAPE_HEADER_BYTES
        .saturating_add(frame_count as usize)
        .saturating_add(TAPE_FOOTER_BYTES);
    if bytes.len() != expected {
        return Err(TapeError::LengthMismatch {
            frame_count,
            len: bytes.len(),
            expected,
        });
    }

    let footer_at = bytes.len() - TAPE_FOOTER_BYTES;
    let final_score = read_u32_le(bytes, footer_at);
    let final_rng_state = read_u32_le(bytes, footer_at + 4);
    let checksum = read_u32_le(bytes, footer_at + 8);

    let computed = crc32fast::hash(&bytes[..footer_at]);
    if computed != checksum {
        return Err(TapeError::ChecksumMismatch {
            footer: checksum,
            computed,
        });
    }

    if final_score == 0 {
        return Err(TapeError::ZeroScore);
    }

    Ok(TapeMetadata {
        seed,
        frame_count,
        final_score,
        final_rng_state,
        checksum,
    })
}

/// Serialize a tape from its parts, computing the footer checksum.
pub fn serialize_tape(seed: u32, inputs: &[u8], final_score: u32, final_rng_state: u32) -> Vec<u8> {
    let mut tape = Vec::with_capacity(TAPE_HEADER_BYTES + inputs.len() + TAPE_FOOTER_BYTES);
    tape.extend_from_slice(&TAPE_MAGIC.to_le_bytes());
    tape.extend_from_slice(&TAPE_VERSION.to_le_bytes());
    tape.extend_from_slice(&seed.to_le_bytes());
    tape.extend_from_slice(&(inputs.len() as u32).to_le_bytes());
    tape.extend_from_slice(inputs);

    let checksum = crc32fast::hash(&tape);
    tape.extend_from_slice(&final_score.to_le_bytes());
    tape.extend_from_slice(&final_rng_state.to_le_bytes());
    tape.extend_from_slice(&checksum.to_le_bytes());
    tape
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 2 * 1024 * 1024;

    #[test]
    fn round_trip_recovers_metadata() {
        let inputs = vec![0x01, 0x02, 0x00, 0x04];
        let tape = serialize_tape(0xDEAD_BEEF, &inputs, 90, 0xEB07_19CE);
        assert_eq!(tape.len(), TAPE_HEADER_BYTES + inputs.len() + TAPE_FOOTER_BYTES);

        let meta = validate_tape(&tape, MAX).unwrap();
        assert_eq!(meta.seed, 0xDEAD_BEEF);
        assert_eq!(meta.frame_count, 4);
        assert_eq!(meta.final_score, 90);
        assert_eq!(meta.final_rng_state, 0xEB07_19CE);
        assert_eq!(meta.checksum, crc32fast::hash(&tape[..tape.len() - 12]));
    }

    #[test]
    fn empty_tape_rejected() {
        assert_eq!(validate_tape(&[], MAX), Err(TapeError::Empty));
    }

    #[test]
    fn oversize_tape_rejected() {
        let tape = serialize_tape(1, &[0u8; 64], 10, 2);
        let err = validate_tape(&tape, 32).unwrap_err();
        assert!(matches!(err, TapeError::TooLarge { .. }));
        assert_eq!(err.code(), "tape_too_large");
    }

    #[test]
    fn bad_magic_rejected() {
        let mut tape = serialize_tape(1, &[0u8; 3], 10, 2);
        tape[0] ^= 0xFF;
        assert!(matches!(
            validate_tape(&tape, MAX),
            Err(TapeError::BadMagic { .. })
        ));
    }

    #[test]
    fn bad_version_rejected() {
        let mut tape = serialize_tape(1, &[0u8; 3], 10, 2);
        tape[4] = 9;
        assert!(matches!(
            validate_tape(&tape, MAX),
            Err(TapeError::BadVersion { found: 9 })
        ));
    }

    #[test]
    fn off_by_one_length_rejected() {
        let tape = serialize_tape(1, &[0u8; 8], 10, 2);

        let mut longer = tape.clone();
        longer.push(0);
        assert!(matches!(
            validate_tape(&longer, MAX),
            Err(TapeError::LengthMismatch { .. })
        ));

        let shorter = &tape[..tape.len() - 1];
        assert!(matches!(
            validate_tape(shorter, MAX),
            Err(TapeError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn corrupted_body_fails_crc() {
        let mut tape = serialize_tape(1, &[0u8; 8], 10, 2);
        tape[TAPE_HEADER_BYTES] ^= 0xFF;
        let err = validate_tape(&tape, MAX).unwrap_err();
        assert!(matches!(err, TapeError::ChecksumMismatch { .. }));
        assert_eq!(err.code(), "tape_malformed");
    }

    #[test]
    fn zero_score_rejected_with_distinct_code() {
        let tape = serialize_tape(0xDEAD_BEEF, &[0x00], 0, 0xAABB_CCDD);
        let err = validate_tape(&tape, MAX).unwrap_err();
        assert_eq!(err, TapeError::ZeroScore);
        assert_eq!(err.code(), "zero_score_not_allowed");
    }

    #[test]
    fn zero_frames_with_valid_crc_accepted() {
        let tape = serialize_tape(7, &[], 1, 0);
        let meta = validate_tape(&tape, MAX).unwrap();
        assert_eq!(meta.frame_count, 0);
        assert_eq!(meta.final_score, 1);
    }
}
