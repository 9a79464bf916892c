//! The alarm-driven polling state machine.
//!
//! An alarm execution runs in three phases: decide what to do under the
//! gate, perform network I/O with no locks held, then re-validate the
//! record and apply the outcome under the gate. A kick (reader-triggered
//! refresh) follows the same path but does a single poll and never
//! schedules follow-up work or backoff retries.

use std::time::Duration;

use anyhow::Result;
use gateway_types::{now_unix_s, JobStatus, ProverStatus};
use prover_client::{PollOutcome, SubmitOutcome};
use storage::blobs::result_key;
use tracing::{info, warn};
use uuid::Uuid;

use super::backoff::retry_delay_secs;
use super::Coordinator;

const OOM_MARKERS: [&str; 3] = ["out of memory", "oom", "memory limit"];

/// Substring heuristic on the last poll error; when it fires the recovery
/// re-submission runs with a reduced segment limit.
pub(crate) fn is_oom_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    OOM_MARKERS.iter().any(|marker| lower.contains(marker))
}

enum CycleAction {
    Done,
    Poll {
        job_id: Uuid,
        prover_job_id: String,
        budget: Duration,
    },
    Recover {
        job_id: Uuid,
    },
}

impl Coordinator {
    /// Scheduled alarm entry point: one full poll cycle with budget,
    /// backoff, recovery, and rescheduling.
    pub async fn alarm(&self) -> Result<()> {
        let _busy = self.alarm_busy().lock().await;
        self.run_poll_cycle(true).await
    }

    /// Reader-triggered refresh: a single cheap poll that applies the same
    /// state transitions but never reschedules and never enters recovery.
    /// Skipped entirely when an alarm is already running.
    pub async fn kick_alarm(&self) -> Result<()> {
        let Ok(_busy) = self.alarm_busy().try_lock() else {
            return Ok(());
        };
        self.run_poll_cycle(false).await
    }

    async fn run_poll_cycle(&self, scheduled: bool) -> Result<()> {
        let action = {
            let _g = self.gate().lock().await;
            let Some(job_id) = self.records().active_job_id().await? else {
                return Ok(());
            };
            let Some(record) = self.records().get(job_id).await? else {
                self.records().set_active_job_id(None).await?;
                return Ok(());
            };
            if record.is_terminal() {
                self.records().set_active_job_id(None).await?;
                return Ok(());
            }

            let now = now_unix_s();
            if record.age_secs(now) > self.config().max_job_wall_time.as_secs() {
                self.force_fail_locked(record, "exceeded wall-time limit".to_string())
                    .await?;
                return Ok(());
            }

            match record.status {
                JobStatus::ProverRunning | JobStatus::Retrying => {}
                // Queued and dispatching jobs belong to the queue consumer.
                _ => return Ok(()),
            }

            if record.status == JobStatus::Retrying {
                if let Some(due) = record.queue.next_retry_at {
                    if now < due {
                        if scheduled {
                            self.schedule_alarm(Duration::from_secs(due - now));
                        }
                        return Ok(());
                    }
                }
            }

            match record.prover.prover_job_id.clone() {
                Some(prover_job_id) => {
                    let elapsed = record.age_secs(now);
                    let deadline = self.config().poll_deadline.as_secs();
                    if elapsed >= deadline {
                        self.force_fail_locked(
                            record,
                            format!("proving timed out after {} minutes", deadline / 60),
                        )
                        .await?;
                        return Ok(());
                    }
                    let remaining = Duration::from_secs(deadline - elapsed);
                    CycleAction::Poll {
                        job_id,
                        prover_job_id,
                        budget: self.config().poll_budget.min(remaining),
                    }
                }
                // No prover job: mid-recovery jobs resume here, everything
                // else is waiting on a queue redelivery.
                None if record.prover.recovery_attempts > 0 => CycleAction::Recover { job_id },
                None => CycleAction::Done,
            }
        };

        match action {
            CycleAction::Done => Ok(()),
            CycleAction::Poll {
                job_id,
                prover_job_id,
                budget,
            } => {
                let outcome = if scheduled {
                    self.prover()
                        .poll_bounded(&prover_job_id, budget, self.config().poll_interval)
                        .await
                } else {
                    self.prover().poll_once(&prover_job_id).await
                };
                self.apply_poll_outcome(job_id, &prover_job_id, outcome, scheduled)
                    .await
            }
            CycleAction::Recover { job_id } => {
                if scheduled {
                    self.attempt_recovery(job_id).await
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn apply_poll_outcome(
        &self,
        job_id: Uuid,
        polled_prover_job_id: &str,
        outcome: PollOutcome,
        scheduled: bool,
    ) -> Result<()> {
        let _g = self.gate().lock().await;
        let Some(mut record) = self.records().get(job_id).await? else {
            return Ok(());
        };
        // The record may have been cancelled or re-submitted while the poll
        // was in flight; outcomes for a stale prover job are dropped.
        if record.is_terminal()
            || record.prover.prover_job_id.as_deref() != Some(polled_prover_job_id)
        {
            return Ok(());
        }

        let now = now_unix_s();
        match outcome {
            PollOutcome::Running(status) => {
                record.prover.prover_status = status.or(record.prover.prover_status);
                record.prover.last_polled_at = Some(now);
                record.status = JobStatus::ProverRunning;
                record.updated_at = now;
                self.records().put(&record).await?;
                if scheduled {
                    self.schedule_alarm(self.config().poll_interval);
                }
                Ok(())
            }

            PollOutcome::Success(success) => {
                let summary = match self.prover().summarize(&success) {
                    Ok(summary) => summary,
                    Err(e) => {
                        return self.force_fail_locked(record, e.to_string()).await;
                    }
                };

                let artifact_key = result_key(job_id);
                let artifact = serde_json::json!({
                    "stored_at": now,
                    "prover_response": success.raw,
                });
                let bytes = serde_json::to_vec(&artifact)?;
                match self
                    .blobs()
                    .put(&artifact_key, &bytes, "application/json")
                    .await
                {
                    Ok(()) => {
                        record.prover.prover_status = Some(ProverStatus::Succeeded);
                        record.prover.last_polled_at = Some(now);
                        self.finish_success_locked(record, summary, artifact_key).await
                    }
                    Err(e) => {
                        // The proof exists; only our copy of it failed. Retry
                        // without touching the active slot — the artifact key
                        // is deterministic and the write idempotent.
                        record.prover.polling_errors += 1;
                        let delay = retry_delay_secs(
                            record.prover.polling_errors,
                            self.config().max_retry_delay_secs,
                        );
                        record.status = JobStatus::Retrying;
                        record.queue.last_error =
                            Some(format!("failed to persist result artifact: {e}"));
                        record.queue.next_retry_at = Some(now + delay);
                        record.updated_at = now;
                        self.records().put(&record).await?;
                        if scheduled {
                            self.schedule_alarm(Duration::from_secs(delay));
                        }
                        Ok(())
                    }
                }
            }

            PollOutcome::Retry {
                message,
                clear_prover_job: false,
            } => {
                record.prover.polling_errors += 1;
                record.prover.last_polled_at = Some(now);
                record.queue.last_error = Some(message);
                record.updated_at = now;
                if scheduled {
                    let delay = retry_delay_secs(
                        record.prover.polling_errors,
                        self.config().max_retry_delay_secs,
                    );
                    record.status = JobStatus::Retrying;
                    record.queue.next_retry_at = Some(now + delay);
                    self.records().put(&record).await?;
                    self.schedule_alarm(Duration::from_secs(delay));
                } else {
                    self.records().put(&record).await?;
                }
                Ok(())
            }

            PollOutcome::Retry {
                message,
                clear_prover_job: true,
            } => {
                if !scheduled {
                    record.queue.last_error = Some(message);
                    record.updated_at = now;
                    self.records().put(&record).await?;
                    return Ok(());
                }

                record.prover.polling_errors += 1;
                record.prover.prover_job_id = None;
                record.prover.prover_status = None;
                record.prover.status_url = None;
                record.prover.recovery_attempts += 1;
                let attempts = record.prover.recovery_attempts;
                if attempts > self.config().max_recovery_attempts {
                    return self
                        .force_fail_locked(
                            record,
                            format!(
                                "prover recovery exhausted after {attempts} attempt(s): {message}"
                            ),
                        )
                        .await;
                }

                if is_oom_error(&message) {
                    let prev = record
                        .prover
                        .segment_limit_po2
                        .unwrap_or(self.config().default_segment_limit_po2);
                    if prev > self.config().min_segment_limit_po2 {
                        let reduced = (prev - 1)
                            .min(self.config().oom_fallback_po2)
                            .max(self.config().min_segment_limit_po2);
                        warn!(
                            job_id = %job_id,
                            from = prev,
                            to = reduced,
                            "prover ran out of memory, lowering segment limit for recovery"
                        );
                        record.prover.segment_limit_po2 = Some(reduced);
                    }
                }

                info!(job_id = %job_id, attempt = attempts, reason = %message, "prover lost the job, recovering");
                record.status = JobStatus::Retrying;
                record.queue.last_error = Some(message);
                record.updated_at = now;
                self.records().put(&record).await?;
                drop(_g);
                self.attempt_recovery(job_id).await
            }

            PollOutcome::Fatal(message) => self.force_fail_locked(record, message).await,
        }
    }

    /// Re-submit the stored tape after the prover lost the job.
    pub(crate) async fn attempt_recovery(&self, job_id: Uuid) -> Result<()> {
        let (blob_key, segment_limit_po2) = {
            let _g = self.gate().lock().await;
            let Some(record) = self.records().get(job_id).await? else {
                return Ok(());
            };
            if record.is_terminal() || record.prover.prover_job_id.is_some() {
                return Ok(());
            }
            (
                record.tape.blob_key.clone(),
                record
                    .prover
                    .segment_limit_po2
                    .unwrap_or(self.config().default_segment_limit_po2),
            )
        };

        let Some(tape) = self.blobs().get(&blob_key).await? else {
            return self
                .mark_failed(job_id, "missing tape artifact".to_string())
                .await;
        };

        let outcome = self.prover().submit_tape(&tape, segment_limit_po2).await;

        let (recovery_attempts, polling_errors) = {
            let _g = self.gate().lock().await;
            let Some(record) = self.records().get(job_id).await? else {
                return Ok(());
            };
            if record.is_terminal() || record.prover.prover_job_id.is_some() {
                return Ok(());
            }
            (
                record.prover.recovery_attempts,
                record.prover.polling_errors,
            )
        };

        match outcome {
            SubmitOutcome::Accepted(accepted) => {
                info!(
                    job_id = %job_id,
                    prover_job_id = %accepted.prover_job_id,
                    "recovery re-submission accepted"
                );
                self.mark_prover_accepted(job_id, accepted, Some(recovery_attempts))
                    .await
            }
            SubmitOutcome::Retry(reason) => {
                let delay = retry_delay_secs(
                    recovery_attempts.max(polling_errors),
                    self.config().max_retry_delay_secs,
                );
                self.mark_retry(job_id, reason, now_unix_s() + delay, false)
                    .await?;
                self.schedule_alarm(Duration::from_secs(delay));
                Ok(())
            }
            SubmitOutcome::Fatal(reason) => self.mark_failed(job_id, reason).await,
        }
    }
}
