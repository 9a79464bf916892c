//! Proof queue consumer: takes one delivery at a time, performs the
//! health-gated submission to the prover, and reports the outcome back into
//! the coordinator. Polling after acceptance is the alarm's job, not ours.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use gateway_types::now_unix_s;
use prover_client::{ProverClient, SubmitOutcome};
use storage::blobs::BlobStore;
use tracing::{error, info};

use crate::coordinator::{retry_delay_secs, BeginAttempt, Coordinator};
use crate::queue::{ConsumeDecision, Delivery};

pub struct ProofConsumer {
    coordinator: Arc<Coordinator>,
    blobs: Arc<dyn BlobStore>,
    prover: Arc<ProverClient>,
    max_queue_retries: u32,
}

impl ProofConsumer {
    pub fn new(
        coordinator: Arc<Coordinator>,
        blobs: Arc<dyn BlobStore>,
        prover: Arc<ProverClient>,
        max_queue_retries: u32,
    ) -> Self {
        ProofConsumer {
            coordinator,
            blobs,
            prover,
            max_queue_retries,
        }
    }

    pub async fn handle(&self, delivery: Delivery) -> ConsumeDecision {
        match self.process(delivery).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(job_id = %delivery.job_id, "proof delivery crashed: {e:#}");
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
            .begin_queue_attempt(job_id, delivery.attempt)
            .await?
        {
            BeginAttempt::Proceed(record) => record,
            BeginAttempt::AlreadyDispatched | BeginAttempt::Skip => {
                return Ok(ConsumeDecision::Ack)
            }
        };

        let cfg = self.coordinator.config();
        let now = now_unix_s();
        if record.age_secs(now) > cfg.max_job_wall_time.as_secs() {
            let minutes = cfg.max_job_wall_time.as_secs() / 60;
            self.coordinator
                .mark_failed(
                    job_id,
                    format!(
                        "timed out after {minutes} minutes (attempt {})",
                        delivery.attempt
                    ),
                )
                .await?;
            return Ok(ConsumeDecision::Ack);
        }

        let Some(tape) = self.blobs.get(&record.tape.blob_key).await? else {
            self.coordinator
                .mark_failed(job_id, "missing tape artifact".to_string())
                .await?;
            return Ok(ConsumeDecision::Ack);
        };

        let segment_limit_po2 = record
            .prover
            .segment_limit_po2
            .unwrap_or(cfg.default_segment_limit_po2);
        info!(
            job_id = %job_id,
            attempt = delivery.attempt,
            segment_limit_po2,
            "submitting tape to prover"
        );

        match self.prover.submit_tape(&tape, segment_limit_po2).await {
            SubmitOutcome::Accepted(accepted) => {
                self.coordinator
                    .mark_prover_accepted(job_id, accepted, None)
                    .await?;
                Ok(ConsumeDecision::Ack)
            }
            SubmitOutcome::Retry(reason) => {
                if delivery.attempt >= self.max_queue_retries {
                    self.coordinator
                        .mark_failed(
                            job_id,
                            format!(
                                "{reason} (exhausted {} delivery attempts)",
                                delivery.attempt
                            ),
                        )
                        .await?;
                    Ok(ConsumeDecision::Ack)
                } else {
                    let delay =
                        retry_delay_secs(delivery.attempt, cfg.max_retry_delay_secs);
                    self.coordinator
                        .mark_retry(job_id, reason, now + delay, false)
                        .await?;
                    Ok(ConsumeDecision::Retry {
                        delay: Duration::from_secs(delay),
                    })
                }
            }
            SubmitOutcome::Fatal(reason) => {
                self.coordinator.mark_failed(job_id, reason).await?;
                Ok(ConsumeDecision::Ack)
            }
        }
    }
}
