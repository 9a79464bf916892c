use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Identifier of the game ruleset this gateway accepts proofs for.
/// The prover commits it as the last word of the journal; the ASCII tag
/// `"AST3"` packed into a u32.
pub const EXPECTED_RULES_DIGEST: u32 = 0x4153_5433;
pub const RULESET: &str = "ast3";

pub const JOURNAL_BYTES: usize = 24;

/// The 24-byte summary the prover commits into every proof: six u32 values,
/// little-endian, in fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Journal {
    pub seed: u32,
    pub frame_count: u32,
    pub final_score: u32,
    pub final_rng_state: u32,
    pub tape_checksum: u32,
    pub rules_digest: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JournalError {
    #[error("journal is {0} bytes, expected {JOURNAL_BYTES}")]
    BadLength(usize),
}

impl Journal {
    /// Canonical wire encoding.
    pub fn to_bytes(&self) -> [u8; JOURNAL_BYTES] {
        let mut out = [0u8; JOURNAL_BYTES];
        for (i, word) in [
            self.seed,
            self.frame_count,
            self.final_score,
            self.final_rng_state,
            self.tape_checksum,
            self.rules_digest,
        ]
        .into_iter()
        .enumerate()
        {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, JournalError> {
        if bytes.len() != JOURNAL_BYTES {
            return Err(JournalError::BadLength(bytes.len()));
        }
        let word = |i: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            u32::from_le_bytes(buf)
        };
        Ok(Journal {
            seed: word(0),
            frame_count: word(1),
            final_score: word(2),
            final_rng_state: word(3),
            tape_checksum: word(4),
            rules_digest: word(5),
        })
    }

    /// SHA-256 over the canonical encoding; this is what the settlement
    /// contract verifies the seal against.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.to_bytes());
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Journal {
        Journal {
            seed: 0xDEAD_BEEF,
            frame_count: 3980,
            final_score: 90,
            final_rng_state: 0xEB07_19CE,
            tape_checksum: 0x112E_9DE5,
            rules_digest: EXPECTED_RULES_DIGEST,
        }
    }

    #[test]
    fn encoding_is_little_endian_fixed_order() {
        let bytes = sample().to_bytes();
        assert_eq!(&bytes[0..4], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(&bytes[4..8], &3980u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &90u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &EXPECTED_RULES_DIGEST.to_le_bytes());
    }

    #[test]
    fn round_trip_is_identity() {
        let journal = sample();
        let bytes = journal.to_bytes();
        let decoded = Journal::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, journal);
        assert_eq!(decoded.to_bytes(), bytes);
    }

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(sample().digest(), sample().digest());
    }

    #[test]
    fn wrong_length_rejected() {
        assert_eq!(
            Journal::from_bytes(&[0u8; 23]),
            Err(JournalError::BadLength(23))
        );
    }

    #[test]
    fn rules_digest_spells_the_ruleset_tag() {
        assert_eq!(EXPECTED_RULES_DIGEST.to_be_bytes(), *b"AST3");
    }
}
