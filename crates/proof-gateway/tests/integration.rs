//! End-to-end tests: a real gateway wired to in-memory stores and to mock
//! prover and relayer HTTP servers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use gateway_types::{
    now_unix_s, serialize_tape, validate_tape, ClaimStatus, JobStatus, Journal, ProofJobRecord,
    EXPECTED_RULES_DIGEST,
};
use proof_gateway::coordinator::{Coordinator, CoordinatorConfig};
use proof_gateway::pipeline::claim::ClaimConsumer;
use proof_gateway::pipeline::dlq;
use proof_gateway::pipeline::proof::ProofConsumer;
use proof_gateway::queue::Queue;
use proof_gateway::relay::{RelayClient, RelayConfig};
use proof_gateway::server::{router, AppState};
use prover_client::{ProverClient, ProverClientConfig};
use serde_json::json;
use storage::blobs::testing::MemoryBlobStore;
use storage::blobs::BlobStore;
use storage::records::testing::MemoryRecordStore;
use storage::records::RecordStore;
use tower::util::ServiceExt;
use url::Url;
use uuid::Uuid;

const IMAGE_ID: &str = "aa11bb22cc33dd44ee55ff660077881199aabbccddeeff00112233445566aabb";

// ── mock prover ──

struct ProverBehavior {
    health_rules_digest: u32,
    /// Submissions with a 1-based index below this are "lost": their polls
    /// return 404.
    lose_submissions_before: u32,
    /// Per-job polls returning "running" before success.
    polls_before_success: u32,
    journal: Journal,
}

#[derive(Default)]
struct ProverLog {
    submissions: u32,
    poll_counts: HashMap<String, u32>,
}

#[derive(Clone)]
struct MockProver {
    behavior: Arc<ProverBehavior>,
    log: Arc<Mutex<ProverLog>>,
}

impl MockProver {
    fn new(behavior: ProverBehavior) -> Self {
        MockProver {
            behavior: Arc::new(behavior),
            log: Arc::new(Mutex::new(ProverLog::default())),
        }
    }

    fn submissions(&self) -> u32 {
        self.log.lock().unwrap().submissions
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/health", get(prover_health))
            .route("/api/jobs/prove-tape/raw", post(prover_submit))
            .route("/api/jobs/:job_id", get(prover_poll))
            .with_state(self.clone())
    }
}

async fn prover_health(State(prover): State<MockProver>) -> impl IntoResponse {
    Json(json!({
        "image_id": IMAGE_ID,
        "rules_digest": prover.behavior.health_rules_digest,
        "ruleset": "ast3",
    }))
}

async fn prover_submit(State(prover): State<MockProver>) -> impl IntoResponse {
    let mut log = prover.log.lock().unwrap();
    log.submissions += 1;
    let job_id = format!("job-{}", log.submissions);
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "job_id": job_id,
            "status_url": format!("/api/jobs/{job_id}"),
        })),
    )
}

async fn prover_poll(
    State(prover): State<MockProver>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let index: u32 = job_id
        .strip_prefix("job-")
        .and_then(|n| n.parse().ok())
        .unwrap_or(0);
    if index < prover.behavior.lose_submissions_before {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": "job not found" })),
        )
            .into_response();
    }

    let polls = {
        let mut log = prover.log.lock().unwrap();
        let count = log.poll_counts.entry(job_id.clone()).or_insert(0);
        *count += 1;
        *count
    };

    if polls <= prover.behavior.polls_before_success {
        return Json(json!({ "success": true, "status": "running" })).into_response();
    }

    let journal = prover.behavior.journal;
    let seal: Vec<u8> = (0..256u32).map(|i| (i % 251) as u8).collect();
    Json(json!({
        "success": true,
        "status": "succeeded",
        "result": {
            "elapsed_ms": 1234,
            "proof": {
                "journal": {
                    "seed": journal.seed,
                    "frame_count": journal.frame_count,
                    "final_score": journal.final_score,
                    "final_rng_state": journal.final_rng_state,
                    "tape_checksum": journal.tape_checksum,
                    "rules_digest": journal.rules_digest,
                },
                "receipt": {
                    "inner": {
                        "Groth16": {
                            "seal": seal,
                            "verifier_parameters": [0xAABBCCDDu32, 1, 2, 3, 4, 5, 6, 7],
                        }
                    }
                },
                "requested_receipt_kind": "groth16",
                "produced_receipt_kind": "groth16",
                "stats": {
                    "segments": 3,
                    "total_cycles": 100,
                    "user_cycles": 80,
                    "paging_cycles": 15,
                    "reserved_cycles": 5,
                },
            },
        },
    }))
    .into_response()
}

// ── mock relayer ──

#[derive(Clone)]
struct MockRelay {
    /// `None` → success with a tx hash; `Some(msg)` → HTTP 400 with `msg`.
    reject_with: Option<String>,
}

async fn relay_handler(State(relay): State<MockRelay>) -> axum::response::Response {
    match &relay.reject_with {
        None => Json(json!({ "tx_hash": "deadbeefcafef00d" })).into_response(),
        Some(message) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": message })),
        )
            .into_response(),
    }
}

async fn spawn_server(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

// ── gateway harness ──

struct Gateway {
    app: Router,
    coordinator: Arc<Coordinator>,
    records: Arc<MemoryRecordStore>,
}

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        max_job_wall_time: Duration::from_secs(60),
        poll_deadline: Duration::from_secs(30),
        poll_budget: Duration::from_secs(5),
        poll_interval: Duration::from_millis(50),
        max_retry_delay_secs: 2,
        ..CoordinatorConfig::default()
    }
}

async fn start_gateway(
    prover_addr: SocketAddr,
    relay_addr: SocketAddr,
    cfg: CoordinatorConfig,
) -> Gateway {
    let records = Arc::new(MemoryRecordStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let records_dyn: Arc<dyn RecordStore> = records.clone();
    let blobs_dyn: Arc<dyn BlobStore> = blobs.clone();

    let mut prover_config =
        ProverClientConfig::new(Url::parse(&format!("http://{prover_addr}/")).unwrap());
    prover_config.timeout = Duration::from_secs(5);
    prover_config.health_cache_ttl = Duration::from_millis(100);
    let prover = Arc::new(ProverClient::new(prover_config).unwrap());

    let relay = Arc::new(
        RelayClient::new(RelayConfig {
            endpoint: Url::parse(&format!("http://{relay_addr}/relay")).unwrap(),
            api_key: None,
            timeout: Duration::from_secs(5),
        })
        .unwrap(),
    );

    let mut proof_queue = Queue::new("proof", 5);
    let mut claim_queue = Queue::new("claim", 5);
    let proof_dlq = proof_queue.take_dlq();
    let claim_dlq = claim_queue.take_dlq();

    let coordinator = Coordinator::new(
        records_dyn,
        blobs_dyn.clone(),
        prover.clone(),
        proof_queue.handle(),
        claim_queue.handle(),
        cfg,
    );

    let proof_consumer = Arc::new(ProofConsumer::new(
        coordinator.clone(),
        blobs_dyn.clone(),
        prover.clone(),
        5,
    ));
    tokio::spawn(proof_queue.run(move |delivery| {
        let consumer = proof_consumer.clone();
        async move { consumer.handle(delivery).await }
    }));

    let claim_consumer = Arc::new(ClaimConsumer::new(
        coordinator.clone(),
        blobs_dyn.clone(),
        relay,
        5,
    ));
    tokio::spawn(claim_queue.run(move |delivery| {
        let consumer = claim_consumer.clone();
        async move { consumer.handle(delivery).await }
    }));

    tokio::spawn(dlq::run_proof_dlq(coordinator.clone(), proof_dlq));
    tokio::spawn(dlq::run_claim_dlq(coordinator.clone(), claim_dlq));

    let state = AppState {
        coordinator: coordinator.clone(),
        blobs: blobs_dyn,
        prover,
        max_tape_bytes: 2 * 1024 * 1024,
        api_key: None,
        started_at: now_unix_s(),
    };
    let app = router(state, None);

    Gateway {
        app,
        coordinator,
        records,
    }
}

fn scenario_tape() -> Vec<u8> {
    serialize_tape(0xDEAD_BEEF, &vec![0u8; 3980], 90, 0xEB07_19CE)
}

fn scenario_journal(tape: &[u8]) -> Journal {
    let metadata = validate_tape(tape, usize::MAX).unwrap();
    Journal {
        seed: metadata.seed,
        frame_count: metadata.frame_count,
        final_score: metadata.final_score,
        final_rng_state: metadata.final_rng_state,
        tape_checksum: metadata.checksum,
        rules_digest: EXPECTED_RULES_DIGEST,
    }
}

async fn submit_tape_via_http(gateway: &Gateway, tape: Vec<u8>) -> (StatusCode, serde_json::Value) {
    let response = gateway
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/proofs/jobs?claimant=GTESTCLAIMANT")
                .header("content-type", "application/octet-stream")
                .body(Body::from(tape))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, value)
}

async fn wait_for(
    gateway: &Gateway,
    job_id: Uuid,
    what: &str,
    predicate: impl Fn(&ProofJobRecord) -> bool,
) -> ProofJobRecord {
    for _ in 0..400 {
        if let Some(record) = gateway.coordinator.get_job(job_id).await.unwrap() {
            if predicate(&record) {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what} on job {job_id}");
}

// ── scenarios ──

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_proves_and_settles_the_claim() {
    let tape = scenario_tape();
    let prover = MockProver::new(ProverBehavior {
        health_rules_digest: EXPECTED_RULES_DIGEST,
        lose_submissions_before: 0,
        polls_before_success: 2,
        journal: scenario_journal(&tape),
    });
    let prover_addr = spawn_server(prover.router()).await;
    let relay_addr = spawn_server(
        Router::new()
            .route("/relay", post(relay_handler))
            .with_state(MockRelay { reject_with: None }),
    )
    .await;
    let gateway = start_gateway(prover_addr, relay_addr, fast_config()).await;

    let (status, body) = submit_tape_via_http(&gateway, tape).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["success"], true);
    let job_id: Uuid = body["job"]["job_id"].as_str().unwrap().parse().unwrap();
    assert_eq!(body["status_url"], format!("/api/proofs/jobs/{job_id}"));

    let record = wait_for(&gateway, job_id, "proof success", |r| {
        r.status == JobStatus::Succeeded
    })
    .await;
    let summary = record.result.as_ref().unwrap().summary.clone();
    assert_eq!(summary.journal.final_score, 90);
    assert_eq!(summary.journal.frame_count, 3980);
    assert_eq!(summary.journal.rules_digest, EXPECTED_RULES_DIGEST);
    assert_eq!(summary.elapsed_ms, 1234);

    let record = wait_for(&gateway, job_id, "claim settlement", |r| {
        r.claim.status == ClaimStatus::Succeeded
    })
    .await;
    assert_eq!(record.claim.tx_hash.as_deref(), Some("deadbeefcafef00d"));

    // The slot is free again.
    assert!(gateway.coordinator.get_active_job().await.unwrap().is_none());

    // The stored artifact is served verbatim.
    let response = gateway
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/proofs/jobs/{job_id}/result"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let artifact: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(artifact["prover_response"]["status"], "succeeded");
    assert!(artifact["stored_at"].as_u64().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_score_tapes_are_rejected_at_ingress() {
    let tape = serialize_tape(0xDEAD_BEEF, &[0u8; 16], 0, 0xAABB_CCDD);
    let prover = MockProver::new(ProverBehavior {
        health_rules_digest: EXPECTED_RULES_DIGEST,
        lose_submissions_before: 0,
        polls_before_success: 0,
        journal: scenario_journal(&scenario_tape()),
    });
    let prover_addr = spawn_server(prover.router()).await;
    let relay_addr = spawn_server(
        Router::new()
            .route("/relay", post(relay_handler))
            .with_state(MockRelay { reject_with: None }),
    )
    .await;
    let gateway = start_gateway(prover_addr, relay_addr, fast_config()).await;

    let (status, body) = submit_tape_via_http(&gateway, tape).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "zero_score_not_allowed");

    // No record was created and the slot is untouched.
    assert!(gateway.records.is_empty());
    assert!(gateway.records.active_job_id().await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_submission_is_rejected_with_the_active_view() {
    let tape = scenario_tape();
    let prover = MockProver::new(ProverBehavior {
        health_rules_digest: EXPECTED_RULES_DIGEST,
        lose_submissions_before: 0,
        polls_before_success: u32::MAX,
        journal: scenario_journal(&tape),
    });
    let prover_addr = spawn_server(prover.router()).await;
    let relay_addr = spawn_server(
        Router::new()
            .route("/relay", post(relay_handler))
            .with_state(MockRelay { reject_with: None }),
    )
    .await;
    let gateway = start_gateway(prover_addr, relay_addr, fast_config()).await;

    let (status, body) = submit_tape_via_http(&gateway, tape.clone()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let first_id = body["job"]["job_id"].as_str().unwrap().to_string();

    let (status, body) = submit_tape_via_http(&gateway, tape).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_code"], "prover_busy");
    assert_eq!(body["active_job"]["job_id"], first_id);
    assert_eq!(gateway.records.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn prover_loss_triggers_recovery_and_resubmission() {
    let tape = scenario_tape();
    let prover = MockProver::new(ProverBehavior {
        health_rules_digest: EXPECTED_RULES_DIGEST,
        // First submission is lost (its polls 404); the second succeeds.
        lose_submissions_before: 2,
        polls_before_success: 1,
        journal: scenario_journal(&tape),
    });
    let prover_addr = spawn_server(prover.router()).await;
    let relay_addr = spawn_server(
        Router::new()
            .route("/relay", post(relay_handler))
            .with_state(MockRelay { reject_with: None }),
    )
    .await;
    let gateway = start_gateway(prover_addr, relay_addr, fast_config()).await;

    let (status, body) = submit_tape_via_http(&gateway, tape).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id: Uuid = body["job"]["job_id"].as_str().unwrap().parse().unwrap();

    let record = wait_for(&gateway, job_id, "recovery and success", |r| {
        r.status == JobStatus::Succeeded
    })
    .await;
    assert_eq!(record.prover.recovery_attempts, 1);
    assert_eq!(record.prover.prover_job_id.as_deref(), Some("job-2"));
    assert!(prover.submissions() >= 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn rules_digest_mismatch_fails_jobs_and_degrades_health() {
    let tape = scenario_tape();
    let prover = MockProver::new(ProverBehavior {
        health_rules_digest: 0x1111_2222,
        lose_submissions_before: 0,
        polls_before_success: 0,
        journal: scenario_journal(&tape),
    });
    let prover_addr = spawn_server(prover.router()).await;
    let relay_addr = spawn_server(
        Router::new()
            .route("/relay", post(relay_handler))
            .with_state(MockRelay { reject_with: None }),
    )
    .await;
    let gateway = start_gateway(prover_addr, relay_addr, fast_config()).await;

    let (status, body) = submit_tape_via_http(&gateway, tape).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id: Uuid = body["job"]["job_id"].as_str().unwrap().parse().unwrap();

    let record = wait_for(&gateway, job_id, "fatal health failure", |r| {
        r.status == JobStatus::Failed
    })
    .await;
    let error = record.error.unwrap();
    assert!(
        error.contains("rules_digest mismatch"),
        "unexpected error: {error}"
    );
    assert_eq!(prover.submissions(), 0);

    let response = gateway
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(health["prover"]["status"], "degraded");
}

#[tokio::test(flavor = "multi_thread")]
async fn fatal_relay_error_fails_the_claim_with_a_fallback_payload() {
    let tape = scenario_tape();
    let journal = scenario_journal(&tape);
    let prover = MockProver::new(ProverBehavior {
        health_rules_digest: EXPECTED_RULES_DIGEST,
        lose_submissions_before: 0,
        polls_before_success: 0,
        journal,
    });
    let prover_addr = spawn_server(prover.router()).await;
    let relay_addr = spawn_server(
        Router::new().route("/relay", post(relay_handler)).with_state(MockRelay {
            reject_with: Some("HostError: Error(Contract, #13)".to_string()),
        }),
    )
    .await;
    let gateway = start_gateway(prover_addr, relay_addr, fast_config()).await;

    let (status, body) = submit_tape_via_http(&gateway, tape).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id: Uuid = body["job"]["job_id"].as_str().unwrap().parse().unwrap();

    let record = wait_for(&gateway, job_id, "fatal claim failure", |r| {
        r.claim.status == ClaimStatus::Failed
    })
    .await;
    assert_eq!(record.status, JobStatus::Succeeded);
    let fallback = record.claim.fallback_payload.unwrap();
    assert_eq!(fallback.claimant_address, "GTESTCLAIMANT");
    assert_eq!(fallback.journal_raw_hex, hex::encode(journal.to_bytes()));
    assert_eq!(fallback.journal_digest_hex, hex::encode(journal.digest()));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_frees_the_active_slot() {
    let tape = scenario_tape();
    let prover = MockProver::new(ProverBehavior {
        health_rules_digest: EXPECTED_RULES_DIGEST,
        lose_submissions_before: 0,
        polls_before_success: u32::MAX,
        journal: scenario_journal(&tape),
    });
    let prover_addr = spawn_server(prover.router()).await;
    let relay_addr = spawn_server(
        Router::new()
            .route("/relay", post(relay_handler))
            .with_state(MockRelay { reject_with: None }),
    )
    .await;
    let gateway = start_gateway(prover_addr, relay_addr, fast_config()).await;

    let (status, body) = submit_tape_via_http(&gateway, tape.clone()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id: Uuid = body["job"]["job_id"].as_str().unwrap().parse().unwrap();

    let response = gateway
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/proofs/jobs/{job_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let record = wait_for(&gateway, job_id, "cancellation", |r| {
        r.status == JobStatus::Failed
    })
    .await;
    assert_eq!(record.error.as_deref(), Some("cancelled by client"));
    assert!(gateway.coordinator.get_active_job().await.unwrap().is_none());

    // A new submission is admitted immediately.
    let (status, _) = submit_tape_via_http(&gateway, tape).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}
