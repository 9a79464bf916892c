//! Extraction of the on-chain verifier payload from a stored result
//! artifact: 4 selector bytes (from the receipt's verifier parameters)
//! followed by the 256-byte Groth16 proof.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub const RAW_SEAL_BYTES: usize = 256;
pub const SEAL_BYTES: usize = 260;
const VERIFIER_PARAMETER_WORDS: usize = 8;

#[derive(Deserialize)]
struct ArtifactDoc {
    prover_response: ProverResponseDoc,
}

#[derive(Deserialize)]
struct ProverResponseDoc {
    result: ResultDoc,
}

#[derive(Deserialize)]
struct ResultDoc {
    proof: ProofDoc,
}

#[derive(Deserialize)]
struct ProofDoc {
    receipt: ReceiptDoc,
}

#[derive(Deserialize)]
struct ReceiptDoc {
    inner: InnerReceiptDoc,
}

#[derive(Deserialize)]
struct InnerReceiptDoc {
    #[serde(rename = "Groth16")]
    groth16: Option<Groth16Doc>,
}

#[derive(Deserialize)]
struct Groth16Doc {
    seal: Vec<u8>,
    verifier_parameters: Vec<u32>,
}

/// Dig the Groth16 seal out of a result artifact and prefix it with the
/// 4-byte selector (the first 4 bytes of the verifier parameters encoded as
/// 32 little-endian bytes).
pub fn extract_groth16_seal(artifact: &[u8]) -> Result<Vec<u8>> {
    let doc: ArtifactDoc =
        serde_json::from_slice(artifact).context("result artifact does not parse")?;
    let Some(groth16) = doc.prover_response.result.proof.receipt.inner.groth16 else {
        bail!("receipt does not contain a Groth16 proof");
    };

    if groth16.seal.len() != RAW_SEAL_BYTES {
        bail!(
            "Groth16 seal is {} bytes, expected {RAW_SEAL_BYTES}",
            groth16.seal.len()
        );
    }
    if groth16.verifier_parameters.len() != VERIFIER_PARAMETER_WORDS {
        bail!(
            "receipt has {} verifier parameter words, expected {VERIFIER_PARAMETER_WORDS}",
            groth16.verifier_parameters.len()
        );
    }

    let mut encoded_parameters = Vec::with_capacity(VERIFIER_PARAMETER_WORDS * 4);
    for word in &groth16.verifier_parameters {
        encoded_parameters.extend_from_slice(&word.to_le_bytes());
    }

    let mut seal = Vec::with_capacity(SEAL_BYTES);
    seal.extend_from_slice(&encoded_parameters[..4]);
    seal.extend_from_slice(&groth16.seal);
    Ok(seal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(seal_len: usize, parameters: Vec<u32>) -> Vec<u8> {
        let seal: Vec<u8> = (0..seal_len).map(|i| (i % 251) as u8).collect();
        serde_json::to_vec(&serde_json::json!({
            "stored_at": 1_700_000_000,
            "prover_response": {
                "success": true,
                "status": "succeeded",
                "result": {
                    "elapsed_ms": 1000,
                    "proof": {
                        "receipt": {
                            "inner": {
                                "Groth16": {
                                    "seal": seal,
                                    "verifier_parameters": parameters,
                                }
                            }
                        }
                    }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn selector_is_first_word_little_endian() {
        let bytes = artifact(256, vec![0xAABBCCDD, 1, 2, 3, 4, 5, 6, 7]);
        let seal = extract_groth16_seal(&bytes).unwrap();
        assert_eq!(seal.len(), SEAL_BYTES);
        assert_eq!(&seal[..4], &0xAABBCCDDu32.to_le_bytes());
        assert_eq!(seal[4], 0);
        assert_eq!(seal[5], 1);
    }

    #[test]
    fn wrong_seal_length_rejected() {
        let bytes = artifact(255, vec![0; 8]);
        assert!(extract_groth16_seal(&bytes).is_err());
    }

    #[test]
    fn wrong_parameter_count_rejected() {
        let bytes = artifact(256, vec![0; 7]);
        assert!(extract_groth16_seal(&bytes).is_err());
    }

    #[test]
    fn missing_groth16_variant_rejected() {
        let bytes = serde_json::to_vec(&serde_json::json!({
            "stored_at": 0,
            "prover_response": {
                "result": { "proof": { "receipt": { "inner": { "Succinct": {} } } } }
            }
        }))
        .unwrap();
        let err = extract_groth16_seal(&bytes).unwrap_err();
        assert!(err.to_string().contains("Groth16"));
    }

    #[test]
    fn garbage_artifact_rejected() {
        assert!(extract_groth16_seal(b"not json").is_err());
    }
}
