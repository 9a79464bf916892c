//! In-process job queues with the delivery semantics the pipelines need:
//! at-least-once, exactly one message visible at a time, bounded redelivery
//! with exponential backoff, and a dead-letter channel.
//!
//! Messages carry only the job id; the record store is the source of truth
//! and the queue is just the trigger. Durability across restarts comes from
//! the coordinator's startup recovery, which re-seeds the queue from the
//! active-slot token.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: Uuid,
    /// 1-based delivery attempt.
    pub attempt: u32,
}

/// What a consumer tells the queue after handling one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeDecision {
    Ack,
    Retry { delay: Duration },
}

#[derive(Clone)]
pub struct QueueHandle {
    name: &'static str,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl QueueHandle {
    pub fn send(&self, job_id: Uuid) {
        self.send_delivery(Delivery { job_id, attempt: 1 });
    }

    fn send_delivery(&self, delivery: Delivery) {
        if self.tx.send(delivery).is_err() {
            error!(queue = self.name, job_id = %delivery.job_id, "queue receiver dropped, message lost");
        }
    }
}

pub struct Queue {
    name: &'static str,
    max_deliveries: u32,
    rx: mpsc::UnboundedReceiver<Delivery>,
    handle: QueueHandle,
    dlq_tx: mpsc::UnboundedSender<Delivery>,
    dlq_rx: Option<mpsc::UnboundedReceiver<Delivery>>,
}

impl Queue {
    pub fn new(name: &'static str, max_deliveries: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (dlq_tx, dlq_rx) = mpsc::unbounded_channel();
        Queue {
            name,
            max_deliveries,
            rx,
            handle: QueueHandle { name, tx },
            dlq_tx,
            dlq_rx: Some(dlq_rx),
        }
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Take the dead-letter receiver; call once before `run`.
    pub fn take_dlq(&mut self) -> mpsc::UnboundedReceiver<Delivery> {
        self.dlq_rx.take().expect("dead-letter receiver already taken")
    }

    /// Consume deliveries one at a time for the life of the process.
    ///
    /// Redelivery is a delayed re-send with the attempt counter bumped; a
    /// delivery that has used up `max_deliveries` lands on the dead-letter
    /// channel instead.
    pub async fn run<H, F>(mut self, handler: H)
    where
        H: Fn(Delivery) -> F,
        F: Future<Output = ConsumeDecision>,
    {
        info!(queue = self.name, "queue consumer started");
        while let Some(delivery) = self.rx.recv().await {
            match handler(delivery).await {
                ConsumeDecision::Ack => {}
                ConsumeDecision::Retry { delay } => {
                    if delivery.attempt >= self.max_deliveries {
                        warn!(
                            queue = self.name,
                            job_id = %delivery.job_id,
                            attempt = delivery.attempt,
                            "delivery attempts exhausted, dead-lettering"
                        );
                        if self.dlq_tx.send(delivery).is_err() {
                            error!(queue = self.name, job_id = %delivery.job_id, "dead-letter receiver dropped");
                        }
                    } else {
                        let handle = self.handle.clone();
                        let next = Delivery {
                            job_id: delivery.job_id,
                            attempt: delivery.attempt + 1,
                        };
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            handle.send_delivery(next);
                        });
                    }
                }
            }
        }
        info!(queue = self.name, "queue consumer stopped");
    }
}
