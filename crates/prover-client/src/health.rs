use std::sync::Mutex;
use std::time::{Duration, Instant};

use gateway_types::EXPECTED_RULES_DIGEST;
use serde::Serialize;

use crate::error::{ProverClientError, Result};
use crate::types::HealthWire;

/// A health probe that passed all compatibility checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatedHealth {
    pub image_id: String,
    pub rules_digest: u32,
    pub ruleset: String,
}

/// Validate the prover's advertised identity against ours.
///
/// `image_id` must be 32 bytes of hex; when an image id is pinned in config
/// the prover must report exactly that id. The rules digest must equal the
/// compile-time constant, otherwise every proof the prover could produce
/// would be rejected at summarize time anyway.
pub fn validate_health(
    wire: HealthWire,
    expected_image_id: Option<&str>,
) -> Result<ValidatedHealth> {
    let image_id = wire.image_id.trim().to_lowercase();
    let decoded = hex::decode(&image_id)
        .map_err(|e| ProverClientError::HealthInvalid(format!("image_id is not hex: {e}")))?;
    if decoded.len() != 32 {
        return Err(ProverClientError::HealthInvalid(format!(
            "image_id is {} bytes, expected 32",
            decoded.len()
        )));
    }

    if let Some(expected) = expected_image_id {
        if !expected.trim().eq_ignore_ascii_case(&image_id) {
            return Err(ProverClientError::ImageIdMismatch {
                found: image_id,
                expected: expected.to_string(),
            });
        }
    }

    if wire.rules_digest != EXPECTED_RULES_DIGEST {
        return Err(ProverClientError::RulesDigestMismatch {
            found: wire.rules_digest,
            expected: EXPECTED_RULES_DIGEST,
        });
    }

    Ok(ValidatedHealth {
        image_id,
        rules_digest: wire.rules_digest,
        ruleset: wire.ruleset,
    })
}

struct CacheEntry {
    key: String,
    fetched_at: Instant,
    value: ValidatedHealth,
}

/// Process-wide cache for the validated health probe.
///
/// The cache key combines the prover base URL and the pinned image id so a
/// reconfiguration never serves a stale verdict for the wrong prover.
pub struct HealthCache {
    ttl: Duration,
    entry: Mutex<Option<CacheEntry>>,
}

impl HealthCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    pub fn cache_key(base_url: &str, expected_image_id: Option<&str>) -> String {
        format!("{base_url}|{}", expected_image_id.unwrap_or("any"))
    }

    pub fn get(&self, key: &str) -> Option<ValidatedHealth> {
        let entry = self.entry.lock().unwrap();
        match entry.as_ref() {
            Some(e) if e.key == key && e.fetched_at.elapsed() < self.ttl => Some(e.value.clone()),
            _ => None,
        }
    }

    pub fn put(&self, key: String, value: ValidatedHealth) {
        let mut entry = self.entry.lock().unwrap();
        *entry = Some(CacheEntry {
            key,
            fetched_at: Instant::now(),
            value,
        });
    }
}
