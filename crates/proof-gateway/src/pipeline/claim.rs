//! Claim queue consumer: after a proof succeeds, extract the seal from the
//! stored artifact, repack the canonical journal, and relay the on-chain
//! settlement call. Fatal relay failures attach a fallback payload so the
//! client can settle out-of-band.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use gateway_types::{now_unix_s, ClaimFallback, JobResult, ProofJobRecord};
use storage::blobs::BlobStore;
use tracing::{error, info};

use crate::coordinator::{retry_delay_secs, ClaimBegin, Coordinator};
use crate::queue::{ConsumeDecision, Delivery};
use crate::relay::{RelayClient, RelayOutcome};

use super::seal::extract_groth16_seal;

pub struct ClaimConsumer {
    coordinator: Arc<Coordinator>,
    blobs: Arc<dyn BlobStore>,
    relay: Arc<RelayClient>,
    max_claim_attempts: u32,
}

impl ClaimConsumer {
    pub fn new(
        coordinator: Arc<Coordinator>,
        blobs: Arc<dyn BlobStore>,
        relay: Arc<RelayClient>,
        max_claim_attempts: u32,
    ) -> Self {
        ClaimConsumer {
            coordinator,
            blobs,
            relay,
            max_claim_attempts,
        }
    }

    pub async fn handle(&self, delivery: Delivery) -> ConsumeDecision {
        match self.process(delivery).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(job_id = %delivery.job_id, "claim delivery crashed: {e:#}");
                ConsumeDecision::Retry {
                    delay: Duration::from_secs(retry_delay_secs(
                        delivery.attempt,
                        self.coordinator.config().max_retry_delay_secs,
                    )),
                }
            }
        }
    }

    async fn process(&self, delivery: Delivery) -> Result<ConsumeDecision> {
        let job_id = delivery.job_id;
        let record = match self
            .coordinator
            .begin_claim_attempt(job_id, delivery.attempt)
            .await?
        {
            ClaimBegin::Proceed(record) => record,
            ClaimBegin::Skip => return Ok(ConsumeDecision::Ack),
        };

        let Some(result) = record.result.clone() else {
            self.coordinator
                .mark_claim_failed(job_id, "missing proof result".to_string(), None)
                .await?;
            return Ok(ConsumeDecision::Ack);
        };

        let Some(artifact) = self.blobs.get(&result.artifact_key).await? else {
            self.coordinator
                .mark_claim_failed(
                    job_id,
                    "missing proof result artifact".to_string(),
                    Some(fallback_payload(&record, &result)),
                )
                .await?;
            return Ok(ConsumeDecision::Ack);
        };

        let seal = match extract_groth16_seal(&artifact) {
            Ok(seal) => seal,
            Err(e) => {
                self.coordinator
                    .mark_claim_failed(
                        job_id,
                        format!("failed to extract seal from artifact: {e}"),
                        Some(fallback_payload(&record, &result)),
                    )
                    .await?;
                return Ok(ConsumeDecision::Ack);
            }
        };

        let journal_raw = result.summary.journal.to_bytes();
        info!(
            job_id = %job_id,
            attempt = delivery.attempt,
            claimant = %record.claim.claimant_address,
            "relaying on-chain claim"
        );

        match self
            .relay
            .submit_claim(&record.claim.claimant_address, &seal, &journal_raw)
            .await
        {
            RelayOutcome::Success { tx_hash } => {
                self.coordinator.mark_claim_succeeded(job_id, tx_hash).await?;
                Ok(ConsumeDecision::Ack)
            }
            RelayOutcome::Transient(reason) => {
                if delivery.attempt >= self.max_claim_attempts {
                    self.coordinator
                        .mark_claim_failed(
                            job_id,
                            format!(
                                "{reason} (exhausted {} delivery attempts)",
                                delivery.attempt
                            ),
                            Some(fallback_payload(&record, &result)),
                        )
                        .await?;
                    Ok(ConsumeDecision::Ack)
                } else {
                    let now = now_unix_s();
                    let delay = retry_delay_secs(
                        delivery.attempt,
                        self.coordinator.config().max_retry_delay_secs,
                    );
                    self.coordinator
                        .mark_claim_retry(job_id, reason, now + delay)
                        .await?;
                    Ok(ConsumeDecision::Retry {
                        delay: Duration::from_secs(delay),
                    })
                }
            }
            RelayOutcome::Fatal(reason) => {
                self.coordinator
                    .mark_claim_failed(job_id, reason, Some(fallback_payload(&record, &result)))
                    .await?;
                Ok(ConsumeDecision::Ack)
            }
        }
    }
}

fn fallback_payload(record: &ProofJobRecord, result: &JobResult) -> ClaimFallback {
    let journal = result.summary.journal;
    ClaimFallback {
        claimant_address: record.claim.claimant_address.clone(),
        journal_raw_hex: hex::encode(journal.to_bytes()),
        journal_digest_hex: hex::encode(journal.digest()),
        proof_artifact_key: result.artifact_key.clone(),
        note: "relay this payload manually to settle the claim".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_types::{Journal, ProofStats, ResultSummary, TapeInfo, TapeMetadata};

    #[test]
    fn fallback_payload_carries_journal_and_digest() {
        let journal = Journal {
            seed: 1,
            frame_count: 2,
            final_score: 3,
            final_rng_state: 4,
            tape_checksum: 5,
            rules_digest: gateway_types::EXPECTED_RULES_DIGEST,
        };
        let tape = TapeInfo {
            size_bytes: 30,
            blob_key: "proof-jobs/x/input.tape".into(),
            metadata: TapeMetadata {
                seed: 1,
                frame_count: 2,
                final_score: 3,
                final_rng_state: 4,
                checksum: 5,
            },
        };
        let mut record = ProofJobRecord::new(tape, "GCLAIMANT".into(), 0);
        let result = JobResult {
            artifact_key: "proof-jobs/x/result.json".into(),
            summary: ResultSummary {
                elapsed_ms: 1,
                requested_receipt_kind: "groth16".into(),
                produced_receipt_kind: None,
                journal,
                stats: ProofStats::default(),
            },
        };
        record.result = Some(result.clone());

        let fallback = fallback_payload(&record, &result);
        assert_eq!(fallback.claimant_address, "GCLAIMANT");
        assert_eq!(fallback.journal_raw_hex, hex::encode(journal.to_bytes()));
        assert_eq!(fallback.journal_digest_hex, hex::encode(journal.digest()));
        assert_eq!(fallback.proof_artifact_key, "proof-jobs/x/result.json");
    }
}
