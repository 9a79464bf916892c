pub mod job;
pub mod journal;
pub mod tape;

pub use job::{
    now_unix_s, ClaimFallback, ClaimState, ClaimStatus, JobResult, JobStatus, ProofJobRecord,
    ProofStats, ProverState, ProverStatus, PublicJobView, PublicProverView, QueueState,
    ResultSummary, TapeInfo,
};
pub use journal::{Journal, JournalError, EXPECTED_RULES_DIGEST, JOURNAL_BYTES, RULESET};
pub use tape::{serialize_tape, validate_tape, TapeError, TapeMetadata, TAPE_MAGIC, TAPE_VERSION};
