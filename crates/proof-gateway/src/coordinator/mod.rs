//! The coordinator: a single-writer actor that owns every job record and the
//! active-slot token. All mutations flow through its entry points and are
//! serialized by an internal gate; polling is driven by scheduled alarms.
//!
//! Network and blob I/O happen outside the gate so readers and submitters
//! are never blocked behind a 45-second poll; each poll outcome is applied
//! only after re-validating the record under the gate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use gateway_types::{
    now_unix_s, ClaimFallback, ClaimStatus, JobResult, JobStatus, ProofJobRecord, ProverStatus,
    ResultSummary, TapeInfo, TapeMetadata,
};
use prover_client::{ProverClient, SubmitAccepted};
use storage::blobs::{tape_key, BlobStore};
use storage::records::RecordStore;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::queue::QueueHandle;

pub mod backoff;
mod poll;
mod retention;

pub use backoff::retry_delay_secs;
pub use retention::JobCounts;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub max_job_wall_time: Duration,
    pub poll_deadline: Duration,
    pub poll_budget: Duration,
    pub poll_interval: Duration,
    pub max_retry_delay_secs: u64,
    pub max_recovery_attempts: u32,
    pub max_completed_jobs: usize,
    pub completed_retention: Duration,
    pub default_segment_limit_po2: u32,
    pub min_segment_limit_po2: u32,
    pub oom_fallback_po2: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            max_job_wall_time: Duration::from_secs(660),
            poll_deadline: Duration::from_secs(600),
            poll_budget: Duration::from_secs(45),
            poll_interval: Duration::from_secs(3),
            max_retry_delay_secs: 30,
            max_recovery_attempts: 3,
            max_completed_jobs: 200,
            completed_retention: Duration::from_secs(24 * 60 * 60),
            default_segment_limit_po2: 20,
            min_segment_limit_po2: 13,
            oom_fallback_po2: 18,
        }
    }
}

#[derive(Debug)]
pub enum CreateJobOutcome {
    Accepted(Box<ProofJobRecord>),
    /// A non-terminal job already holds the active slot.
    Busy(Box<ProofJobRecord>),
}

#[derive(Debug)]
pub enum BeginAttempt {
    /// The consumer should load the tape and submit it.
    Proceed(Box<ProofJobRecord>),
    /// A prover job already exists (crash-recovered redelivery); the alarm
    /// drives the rest.
    AlreadyDispatched,
    /// Record missing or terminal; ack and move on.
    Skip,
}

#[derive(Debug)]
pub enum ClaimBegin {
    Proceed(Box<ProofJobRecord>),
    Skip,
}

pub struct Coordinator {
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    prover: Arc<ProverClient>,
    proof_queue: QueueHandle,
    claim_queue: QueueHandle,
    cfg: CoordinatorConfig,
    /// Serializes every record/token mutation.
    gate: Mutex<()>,
    /// Held for the duration of one alarm execution; guarantees at most one
    /// in-flight poll cycle.
    alarm_busy: Mutex<()>,
    /// Only the most recently scheduled alarm fires; older ones see a newer
    /// generation and return without doing anything.
    alarm_gen: AtomicU64,
    /// Back-reference for spawning alarm tasks from `&self` methods.
    self_ref: Weak<Coordinator>,
}

impl Coordinator {
    pub fn new(
        records: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        prover: Arc<ProverClient>,
        proof_queue: QueueHandle,
        claim_queue: QueueHandle,
        cfg: CoordinatorConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Coordinator {
            records,
            blobs,
            prover,
            proof_queue,
            claim_queue,
            cfg,
            gate: Mutex::new(()),
            alarm_busy: Mutex::new(()),
            alarm_gen: AtomicU64::new(0),
            self_ref: weak.clone(),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.cfg
    }

    /// Admit a validated tape as a new proof job, or reject it while the
    /// active slot is taken. A slot holder that has outlived the wall-time
    /// cap is force-failed (zombie recovery) before the new job is admitted.
    pub async fn create_job(
        &self,
        tape_bytes: &[u8],
        metadata: TapeMetadata,
        claimant_address: String,
    ) -> Result<CreateJobOutcome> {
        let _g = self.gate.lock().await;

        if let Some(active_id) = self.records.active_job_id().await? {
            match self.records.get(active_id).await? {
                Some(active) if !active.is_terminal() => {
                    let now = now_unix_s();
                    if active.age_secs(now) <= self.cfg.max_job_wall_time.as_secs() {
                        return Ok(CreateJobOutcome::Busy(Box::new(active)));
                    }
                    warn!(job_id = %active_id, "active job exceeded wall-time limit, forcing failure");
                    self.force_fail_locked(active, "exceeded wall-time limit".to_string())
                        .await?;
                }
                _ => {
                    // Token points at a terminal or missing record.
                    self.records.set_active_job_id(None).await?;
                }
            }
        }

        let now = now_unix_s();
        let job_id = Uuid::new_v4();
        let blob_key = tape_key(job_id);
        self.blobs
            .put(&blob_key, tape_bytes, "application/octet-stream")
            .await?;

        let tape = TapeInfo {
            size_bytes: tape_bytes.len() as u64,
            blob_key,
            metadata,
        };
        let mut record = ProofJobRecord::new(tape, claimant_address, now);
        record.job_id = job_id;
        self.records.put(&record).await?;
        self.records.set_active_job_id(Some(job_id)).await?;
        self.proof_queue.send(job_id);

        info!(
            job_id = %job_id,
            frames = metadata.frame_count,
            score = metadata.final_score,
            "proof job created"
        );
        Ok(CreateJobOutcome::Accepted(Box::new(record)))
    }

    /// Called by the proof consumer at the top of every delivery.
    pub async fn begin_queue_attempt(
        &self,
        job_id: Uuid,
        attempt: u32,
    ) -> Result<BeginAttempt> {
        let _g = self.gate.lock().await;
        let Some(mut record) = self.records.get(job_id).await? else {
            return Ok(BeginAttempt::Skip);
        };
        if record.is_terminal() {
            return Ok(BeginAttempt::Skip);
        }

        let now = now_unix_s();
        if record.prover.prover_job_id.is_some() {
            record.status = JobStatus::ProverRunning;
            record.updated_at = now;
            self.records.put(&record).await?;
            self.schedule_alarm(self.cfg.poll_interval);
            return Ok(BeginAttempt::AlreadyDispatched);
        }

        record.status = JobStatus::Dispatching;
        record.queue.attempts = record.queue.attempts.max(attempt);
        record.queue.last_attempt_at = Some(now);
        record.updated_at = now;
        self.records.put(&record).await?;
        Ok(BeginAttempt::Proceed(Box::new(record)))
    }

    pub async fn mark_retry(
        &self,
        job_id: Uuid,
        reason: String,
        next_retry_at: u64,
        clear_prover_job: bool,
    ) -> Result<()> {
        let _g = self.gate.lock().await;
        let Some(mut record) = self.records.get(job_id).await? else {
            return Ok(());
        };
        if record.is_terminal() {
            return Ok(());
        }
        record.status = JobStatus::Retrying;
        record.queue.last_error = Some(reason);
        record.queue.next_retry_at = Some(next_retry_at);
        if clear_prover_job {
            record.prover.prover_job_id = None;
            record.prover.prover_status = None;
            record.prover.status_url = None;
        }
        record.updated_at = now_unix_s();
        self.records.put(&record).await?;
        Ok(())
    }

    pub async fn mark_prover_accepted(
        &self,
        job_id: Uuid,
        accepted: SubmitAccepted,
        recovery_attempts: Option<u32>,
    ) -> Result<()> {
        let _g = self.gate.lock().await;
        let Some(mut record) = self.records.get(job_id).await? else {
            return Ok(());
        };
        if record.is_terminal() {
            return Ok(());
        }
        record.status = JobStatus::ProverRunning;
        record.prover.prover_job_id = Some(accepted.prover_job_id.clone());
        record.prover.status_url = Some(accepted.status_url);
        record.prover.segment_limit_po2 = Some(accepted.segment_limit_po2);
        record.prover.prover_status = Some(ProverStatus::Queued);
        if let Some(n) = recovery_attempts {
            record.prover.recovery_attempts = record.prover.recovery_attempts.max(n);
        }
        record.queue.next_retry_at = None;
        record.updated_at = now_unix_s();
        self.records.put(&record).await?;

        info!(job_id = %job_id, prover_job_id = %accepted.prover_job_id, "prover accepted job");
        self.schedule_alarm(self.cfg.poll_interval);
        Ok(())
    }

    /// Terminal success. Idempotent on an already-succeeded record; a failed
    /// record is absorbing and stays failed.
    pub async fn mark_succeeded(
        &self,
        job_id: Uuid,
        summary: ResultSummary,
        artifact_key: String,
    ) -> Result<()> {
        let _g = self.gate.lock().await;
        let Some(record) = self.records.get(job_id).await? else {
            return Ok(());
        };
        if record.is_terminal() {
            return Ok(());
        }
        self.finish_success_locked(record, summary, artifact_key)
            .await
    }

    pub async fn mark_failed(&self, job_id: Uuid, reason: String) -> Result<()> {
        let _g = self.gate.lock().await;
        let Some(record) = self.records.get(job_id).await? else {
            return Ok(());
        };
        self.force_fail_locked(record, reason).await
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<ProofJobRecord>> {
        Ok(self.records.get(job_id).await?)
    }

    pub async fn get_active_job(&self) -> Result<Option<ProofJobRecord>> {
        match self.records.active_job_id().await? {
            Some(id) => Ok(self.records.get(id).await?),
            None => Ok(None),
        }
    }

    // ── claim-side entry points ──

    pub async fn begin_claim_attempt(&self, job_id: Uuid, attempt: u32) -> Result<ClaimBegin> {
        let _g = self.gate.lock().await;
        let Some(mut record) = self.records.get(job_id).await? else {
            return Ok(ClaimBegin::Skip);
        };
        if record.status != JobStatus::Succeeded || record.claim.status.is_terminal() {
            return Ok(ClaimBegin::Skip);
        }
        let now = now_unix_s();
        record.claim.status = ClaimStatus::Submitting;
        record.claim.attempts = record.claim.attempts.max(attempt);
        record.claim.last_attempt_at = Some(now);
        record.updated_at = now;
        self.records.put(&record).await?;
        Ok(ClaimBegin::Proceed(Box::new(record)))
    }

    pub async fn mark_claim_retry(
        &self,
        job_id: Uuid,
        reason: String,
        next_retry_at: u64,
    ) -> Result<()> {
        let _g = self.gate.lock().await;
        let Some(mut record) = self.records.get(job_id).await? else {
            return Ok(());
        };
        if record.claim.status.is_terminal() {
            return Ok(());
        }
        record.claim.status = ClaimStatus::Retrying;
        record.claim.last_error = Some(reason);
        record.claim.next_retry_at = Some(next_retry_at);
        record.updated_at = now_unix_s();
        self.records.put(&record).await?;
        Ok(())
    }

    pub async fn mark_claim_succeeded(&self, job_id: Uuid, tx_hash: String) -> Result<()> {
        let _g = self.gate.lock().await;
        let Some(mut record) = self.records.get(job_id).await? else {
            return Ok(());
        };
        if record.claim.status.is_terminal() {
            return Ok(());
        }
        let now = now_unix_s();
        record.claim.status = ClaimStatus::Succeeded;
        record.claim.tx_hash = Some(tx_hash.clone());
        record.claim.submitted_at = Some(now);
        record.claim.last_error = None;
        record.claim.next_retry_at = None;
        record.updated_at = now;
        self.records.put(&record).await?;
        info!(job_id = %job_id, tx_hash = %tx_hash, "claim settled on-chain");
        Ok(())
    }

    pub async fn mark_claim_failed(
        &self,
        job_id: Uuid,
        reason: String,
        fallback: Option<ClaimFallback>,
    ) -> Result<()> {
        let _g = self.gate.lock().await;
        let Some(mut record) = self.records.get(job_id).await? else {
            return Ok(());
        };
        if record.claim.status.is_terminal() {
            return Ok(());
        }
        record.claim.status = ClaimStatus::Failed;
        record.claim.last_error = Some(reason.clone());
        record.claim.next_retry_at = None;
        record.claim.fallback_payload = fallback;
        record.updated_at = now_unix_s();
        self.records.put(&record).await?;
        warn!(job_id = %job_id, reason = %reason, "claim failed terminally");
        Ok(())
    }

    // ── startup ──

    /// Re-arm in-flight work after a restart. A non-terminal slot holder
    /// with a prover job resumes polling; one without goes back on the proof
    /// queue; a stale token is cleared.
    pub async fn recover(&self) -> Result<()> {
        let _g = self.gate.lock().await;
        let Some(active_id) = self.records.active_job_id().await? else {
            return Ok(());
        };
        match self.records.get(active_id).await? {
            Some(record) if !record.is_terminal() => {
                if record.prover.prover_job_id.is_some() {
                    info!(job_id = %active_id, "resuming poll loop for recovered job");
                    self.schedule_alarm(self.cfg.poll_interval);
                } else {
                    info!(job_id = %active_id, "re-enqueueing recovered job");
                    self.proof_queue.send(active_id);
                }
            }
            _ => {
                warn!(job_id = %active_id, "clearing stale active-slot token");
                self.records.set_active_job_id(None).await?;
            }
        }
        Ok(())
    }

    // ── internals shared across modules ──

    /// Schedule (or replace) the pending alarm. Only the newest scheduled
    /// alarm fires; a running alarm execution is never interrupted.
    pub(crate) fn schedule_alarm(&self, delay: Duration) {
        let gen = self.alarm_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(coordinator) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if coordinator.alarm_gen.load(Ordering::SeqCst) != gen {
                return;
            }
            if let Err(e) = coordinator.alarm().await {
                error!("alarm tick failed: {e:#}");
            }
        });
    }

    /// Terminal failure with slot release, claim cascade, and pruning.
    /// Callers must hold the gate.
    pub(crate) async fn force_fail_locked(
        &self,
        mut record: ProofJobRecord,
        reason: String,
    ) -> Result<()> {
        if record.is_terminal() {
            return Ok(());
        }
        let now = now_unix_s();
        record.status = JobStatus::Failed;
        record.error = Some(reason.clone());
        record.updated_at = now;
        record.completed_at = Some(now);
        if !record.claim.status.is_terminal() {
            record.claim.status = ClaimStatus::Failed;
            record.claim.last_error = Some(format!("proof job failed: {reason}"));
        }
        let job_id = record.job_id;
        self.records.put(&record).await?;
        self.release_slot_locked(job_id).await?;
        warn!(job_id = %job_id, reason = %reason, "proof job failed");
        self.prune_locked().await;
        Ok(())
    }

    /// Terminal success bookkeeping. Callers must hold the gate and have
    /// already written the result artifact.
    pub(crate) async fn finish_success_locked(
        &self,
        mut record: ProofJobRecord,
        summary: ResultSummary,
        artifact_key: String,
    ) -> Result<()> {
        let now = now_unix_s();
        let job_id = record.job_id;
        record.status = JobStatus::Succeeded;
        record.result = Some(JobResult {
            artifact_key,
            summary,
        });
        record.error = None;
        record.queue.next_retry_at = None;
        record.updated_at = now;
        record.completed_at = Some(now);
        self.records.put(&record).await?;
        self.release_slot_locked(job_id).await?;
        self.claim_queue.send(job_id);
        info!(job_id = %job_id, "proof job succeeded");
        self.prune_locked().await;
        Ok(())
    }

    pub(crate) async fn release_slot_locked(&self, job_id: Uuid) -> Result<()> {
        if self.records.active_job_id().await? == Some(job_id) {
            self.records.set_active_job_id(None).await?;
        }
        Ok(())
    }

    pub(crate) fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub(crate) fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub(crate) fn prover(&self) -> &Arc<ProverClient> {
        &self.prover
    }

    pub(crate) fn gate(&self) -> &Mutex<()> {
        &self.gate
    }

    pub(crate) fn alarm_busy(&self) -> &Mutex<()> {
        &self.alarm_busy
    }
}
