use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::journal::Journal;
use crate::tape::TapeMetadata;

pub fn now_unix_s() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Lifecycle of a proof job. `Succeeded` and `Failed` are terminal and
/// absorbing: once reached, the record is never mutated back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Dispatching,
    ProverRunning,
    Retrying,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Status last reported by the upstream prover for its own job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProverStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Queued,
    Submitting,
    Retrying,
    Succeeded,
    Failed,
}

impl ClaimStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ClaimStatus::Succeeded | ClaimStatus::Failed)
    }
}

/// Where the submitted tape lives and what its header/footer said.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeInfo {
    pub size_bytes: u64,
    pub blob_key: String,
    pub metadata: TapeMetadata,
}

/// Delivery bookkeeping for the proof queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    pub attempts: u32,
    pub last_attempt_at: Option<u64>,
    pub last_error: Option<String>,
    pub next_retry_at: Option<u64>,
}

/// Everything we know about the upstream prover's side of this job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProverState {
    pub prover_job_id: Option<String>,
    pub prover_status: Option<ProverStatus>,
    pub status_url: Option<String>,
    pub segment_limit_po2: Option<u32>,
    pub last_polled_at: Option<u64>,
    pub polling_errors: u32,
    pub recovery_attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStats {
    pub segments: u64,
    pub total_cycles: u64,
    pub user_cycles: u64,
    pub paging_cycles: u64,
    pub reserved_cycles: u64,
}

/// Digest of a successful prover response; the full response (receipt
/// included) lives in the result artifact blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub elapsed_ms: u64,
    pub requested_receipt_kind: String,
    pub produced_receipt_kind: Option<String>,
    pub journal: Journal,
    pub stats: ProofStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub artifact_key: String,
    pub summary: ResultSummary,
}

/// Enables a client to relay the claim out-of-band after a fatal relay
/// failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimFallback {
    pub claimant_address: String,
    pub journal_raw_hex: String,
    pub journal_digest_hex: String,
    pub proof_artifact_key: String,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimState {
    pub claimant_address: String,
    pub status: ClaimStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<u64>,
    pub last_error: Option<String>,
    pub next_retry_at: Option<u64>,
    pub submitted_at: Option<u64>,
    pub tx_hash: Option<String>,
    pub fallback_payload: Option<ClaimFallback>,
}

impl ClaimState {
    pub fn new(claimant_address: String) -> Self {
        ClaimState {
            claimant_address,
            status: ClaimStatus::Queued,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            next_retry_at: None,
            submitted_at: None,
            tx_hash: None,
            fallback_payload: None,
        }
    }
}

/// The authoritative job record. Owned and mutated exclusively by the
/// coordinator; everyone else reads snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofJobRecord {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub created_at: u64,
    pub updated_at: u64,
    pub completed_at: Option<u64>,
    pub tape: TapeInfo,
    pub queue: QueueState,
    pub prover: ProverState,
    pub result: Option<JobResult>,
    pub claim: ClaimState,
    pub error: Option<String>,
}

impl ProofJobRecord {
    pub fn new(tape: TapeInfo, claimant_address: String, now: u64) -> Self {
        ProofJobRecord {
            job_id: Uuid::new_v4(),
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            completed_at: None,
            tape,
            queue: QueueState::default(),
            prover: ProverState::default(),
            result: None,
            claim: ClaimState::new(claimant_address),
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }

    /// Instant the record reached (or last touched) its terminal state; used
    /// to order terminal records for retention.
    pub fn terminal_at(&self) -> u64 {
        self.completed_at
            .unwrap_or(0)
            .max(self.updated_at)
            .max(self.created_at)
    }

    pub fn public_view(&self) -> PublicJobView {
        PublicJobView {
            job_id: self.job_id,
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            tape_size_bytes: self.tape.size_bytes,
            tape_metadata: self.tape.metadata,
            queue: self.queue.clone(),
            prover: PublicProverView {
                prover_job_id: self.prover.prover_job_id.clone(),
                prover_status: self.prover.prover_status,
                segment_limit_po2: self.prover.segment_limit_po2,
                last_polled_at: self.prover.last_polled_at,
                polling_errors: self.prover.polling_errors,
                recovery_attempts: self.prover.recovery_attempts,
            },
            result: self.result.as_ref().map(|r| r.summary.clone()),
            claim: self.claim.clone(),
            error: self.error.clone(),
        }
    }
}

/// What HTTP clients see. Internal blob keys and the prover's status URL
/// stay private.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicJobView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    pub tape_size_bytes: u64,
    pub tape_metadata: TapeMetadata,
    pub queue: QueueState,
    pub prover: PublicProverView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultSummary>,
    pub claim: ClaimState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicProverView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prover_job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prover_status: Option<ProverStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_limit_po2: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_polled_at: Option<u64>,
    pub polling_errors: u32,
    pub recovery_attempts: u32,
}
