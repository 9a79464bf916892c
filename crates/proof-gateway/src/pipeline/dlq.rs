//! Dead-letter consumers: the safety net behind both queues. A message that
//! lands here has exhausted its deliveries without any handler reaching a
//! verdict (typically repeated crashes); the corresponding job is forced to
//! a terminal failure so the active slot can never be stranded. Both
//! consumers are idempotent — the coordinator's terminal states absorb
//! duplicate forcing.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, warn};

use crate::coordinator::Coordinator;
use crate::queue::Delivery;

pub async fn run_proof_dlq(coordinator: Arc<Coordinator>, mut rx: UnboundedReceiver<Delivery>) {
    while let Some(delivery) = rx.recv().await {
        warn!(job_id = %delivery.job_id, "proof job dead-lettered");
        let reason = format!(
            "proof delivery attempts exhausted after {} tries (dead-letter)",
            delivery.attempt
        );
        if let Err(e) = coordinator.mark_failed(delivery.job_id, reason).await {
            error!(job_id = %delivery.job_id, "failed to fail dead-lettered job: {e:#}");
        }
    }
}

pub async fn run_claim_dlq(coordinator: Arc<Coordinator>, mut rx: UnboundedReceiver<Delivery>) {
    while let Some(delivery) = rx.recv().await {
        warn!(job_id = %delivery.job_id, "claim dead-lettered");
        let reason = format!(
            "claim delivery attempts exhausted after {} tries (dead-letter)",
            delivery.attempt
        );
        if let Err(e) = coordinator
            .mark_claim_failed(delivery.job_id, reason, None)
            .await
        {
            error!(job_id = %delivery.job_id, "failed to fail dead-lettered claim: {e:#}");
        }
    }
}
