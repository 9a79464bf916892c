//! Retention for terminal records: keep the newest `max_completed_jobs`
//! within the retention window, delete the rest together with their tape
//! blobs. Result artifacts are left to the blob store's own lifecycle.

use anyhow::Result;
use gateway_types::{now_unix_s, JobStatus, ProofJobRecord};
use serde::Serialize;
use tracing::{debug, warn};

use super::Coordinator;

const SCAN_PAGE: usize = 256;

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct JobCounts {
    pub total: usize,
    pub queued: usize,
    pub dispatching: usize,
    pub prover_running: usize,
    pub retrying: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl Coordinator {
    pub(crate) async fn scan_all(&self) -> Result<Vec<ProofJobRecord>> {
        let mut all = Vec::new();
        let mut cursor = None;
        loop {
            let page = self.records().scan(cursor, SCAN_PAGE).await?;
            let n = page.len();
            cursor = page.last().map(|r| r.job_id);
            all.extend(page);
            if n < SCAN_PAGE {
                break;
            }
        }
        Ok(all)
    }

    pub async fn job_counts(&self) -> Result<JobCounts> {
        let mut counts = JobCounts::default();
        for record in self.scan_all().await? {
            counts.total += 1;
            match record.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Dispatching => counts.dispatching += 1,
                JobStatus::ProverRunning => counts.prover_running += 1,
                JobStatus::Retrying => counts.retrying += 1,
                JobStatus::Succeeded => counts.succeeded += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    /// Best-effort pruning pass, run on every terminal transition. Failures
    /// are logged, never propagated — retention must not block completions.
    pub(crate) async fn prune_locked(&self) {
        if let Err(e) = self.try_prune().await {
            warn!("retention pruning failed: {e:#}");
        }
    }

    async fn try_prune(&self) -> Result<()> {
        let mut terminal: Vec<ProofJobRecord> = self
            .scan_all()
            .await?
            .into_iter()
            .filter(|r| r.is_terminal())
            .collect();
        terminal.sort_by_key(|r| r.terminal_at());

        let now = now_unix_s();
        let retention = self.config().completed_retention.as_secs();
        let excess = terminal
            .len()
            .saturating_sub(self.config().max_completed_jobs);

        for (i, record) in terminal.iter().enumerate() {
            let expired = now.saturating_sub(record.terminal_at()) > retention;
            if !expired && i >= excess {
                continue;
            }
            if let Err(e) = self.blobs().delete(&record.tape.blob_key).await {
                warn!(job_id = %record.job_id, "failed to delete tape blob while pruning: {e}");
            }
            self.records().delete(record.job_id).await?;
            debug!(job_id = %record.job_id, "pruned terminal job");
        }
        Ok(())
    }
}
