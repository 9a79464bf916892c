use gateway_types::{Journal, ProofStats, ProverStatus, ResultSummary};
use serde::{Deserialize, Serialize};

/// Wire shape of `POST /api/jobs/prove-tape/raw` 202 responses.
#[derive(Debug, Clone, Deserialize)]
pub struct JobCreatedWire {
    #[serde(default)]
    pub success: bool,
    pub job_id: String,
    pub status_url: String,
}

/// Wire shape of `GET /api/jobs/{job_id}` responses.
#[derive(Debug, Clone, Deserialize)]
pub struct JobStatusWire {
    #[serde(default)]
    pub success: bool,
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub result: Option<JobResultWire>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobResultWire {
    #[serde(default)]
    pub proof: Option<ProofWire>,
    #[serde(default)]
    pub elapsed_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProofWire {
    pub journal: JournalWire,
    /// The full receipt is kept opaque; the claim pipeline digs the seal out
    /// of the stored artifact, not out of this client.
    #[serde(default)]
    pub receipt: Option<serde_json::Value>,
    pub requested_receipt_kind: String,
    #[serde(default)]
    pub produced_receipt_kind: Option<String>,
    pub stats: StatsWire,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct JournalWire {
    pub seed: u32,
    pub frame_count: u32,
    pub final_score: u32,
    pub final_rng_state: u32,
    pub tape_checksum: u32,
    pub rules_digest: u32,
}

impl From<JournalWire> for Journal {
    fn from(w: JournalWire) -> Self {
        Journal {
            seed: w.seed,
            frame_count: w.frame_count,
            final_score: w.final_score,
            final_rng_state: w.final_rng_state,
            tape_checksum: w.tape_checksum,
            rules_digest: w.rules_digest,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct StatsWire {
    #[serde(default)]
    pub segments: u64,
    #[serde(default)]
    pub total_cycles: u64,
    #[serde(default)]
    pub user_cycles: u64,
    #[serde(default)]
    pub paging_cycles: u64,
    #[serde(default)]
    pub reserved_cycles: u64,
}

impl From<StatsWire> for ProofStats {
    fn from(w: StatsWire) -> Self {
        ProofStats {
            segments: w.segments,
            total_cycles: w.total_cycles,
            user_cycles: w.user_cycles,
            paging_cycles: w.paging_cycles,
            reserved_cycles: w.reserved_cycles,
        }
    }
}

/// Wire shape of the prover's `GET /health`.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthWire {
    pub image_id: String,
    pub rules_digest: u32,
    pub ruleset: String,
}

/// A prover job the prover has accepted responsibility for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitAccepted {
    pub prover_job_id: String,
    pub status_url: String,
    pub segment_limit_po2: u32,
}

/// Outcome of a submission attempt, already classified for the caller.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Accepted(SubmitAccepted),
    Retry(String),
    Fatal(String),
}

/// A complete, verified-success poll payload. `raw` is the verbatim response
/// body, persisted unmodified as the result artifact; `parsed` is the typed
/// view used for summaries.
#[derive(Debug, Clone)]
pub struct ProverSuccess {
    pub raw: serde_json::Value,
    pub elapsed_ms: u64,
    pub journal: Journal,
    pub requested_receipt_kind: String,
    pub produced_receipt_kind: Option<String>,
    pub stats: ProofStats,
}

impl ProverSuccess {
    pub fn summary(&self) -> ResultSummary {
        ResultSummary {
            elapsed_ms: self.elapsed_ms,
            requested_receipt_kind: self.requested_receipt_kind.clone(),
            produced_receipt_kind: self.produced_receipt_kind.clone(),
            journal: self.journal,
            stats: self.stats,
        }
    }
}

/// Outcome of a single poll (or a bounded run of polls).
#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// The prover is still working (or the budget ran out before an answer).
    Running(Option<ProverStatus>),
    Success(Box<ProverSuccess>),
    /// Transient trouble. When `clear_prover_job` is set the prover has lost
    /// the job (404, incomplete success payload, retryable failure code) and
    /// the caller must re-submit the tape rather than keep polling.
    Retry {
        message: String,
        clear_prover_job: bool,
    },
    Fatal(String),
}

pub(crate) fn parse_prover_status(s: &str) -> Option<ProverStatus> {
    match s {
        "queued" => Some(ProverStatus::Queued),
        "running" => Some(ProverStatus::Running),
        "succeeded" => Some(ProverStatus::Succeeded),
        "failed" => Some(ProverStatus::Failed),
        _ => None,
    }
}
