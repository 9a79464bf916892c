use std::time::Duration;

use gateway_types::{ProverStatus, ResultSummary, EXPECTED_RULES_DIGEST};
use reqwest::StatusCode;
use tracing::{debug, warn};
use url::Url;

use crate::error::{ProverClientError, Result};
use crate::health::{validate_health, HealthCache, ValidatedHealth};
use crate::types::{
    parse_prover_status, HealthWire, JobCreatedWire, JobStatusWire, PollOutcome, ProverSuccess,
    SubmitAccepted, SubmitOutcome,
};

#[derive(Debug, Clone)]
pub struct ProverClientConfig {
    pub base_url: Url,
    pub api_key: Option<String>,
    pub access_client_id: Option<String>,
    pub access_client_secret: Option<String>,
    pub timeout: Duration,
    pub receipt_kind: String,
    pub segment_limit_po2: u32,
    pub max_frames: u32,
    pub verify_receipt: bool,
    pub expected_image_id: Option<String>,
    pub health_cache_ttl: Duration,
    /// Prover failure codes that mean "the job is gone but the tape is
    /// fine" — re-submission is worth a shot.
    pub retryable_error_codes: Vec<String>,
}

impl ProverClientConfig {
    pub fn new(base_url: Url) -> Self {
        ProverClientConfig {
            base_url,
            api_key: None,
            access_client_id: None,
            access_client_secret: None,
            timeout: Duration::from_secs(30),
            receipt_kind: "groth16".to_string(),
            segment_limit_po2: 20,
            max_frames: 100_000,
            verify_receipt: true,
            expected_image_id: None,
            health_cache_ttl: Duration::from_secs(30),
            retryable_error_codes: vec!["job_not_found".to_string(), "job_evicted".to_string()],
        }
    }
}

pub struct ProverClient {
    http: reqwest::Client,
    config: ProverClientConfig,
    health_cache: HealthCache,
}

impl ProverClient {
    pub fn new(config: ProverClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        let health_cache = HealthCache::new(config.health_cache_ttl);
        Ok(ProverClient {
            http,
            config,
            health_cache,
        })
    }

    pub fn config(&self) -> &ProverClientConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.config
            .base_url
            .join(path)
            .map_err(|e| ProverClientError::Schema(format!("bad prover URL: {e}")))
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut req = req;
        if let Some(key) = &self.config.api_key {
            req = req.header("x-api-key", key);
        }
        if let (Some(id), Some(secret)) = (
            &self.config.access_client_id,
            &self.config.access_client_secret,
        ) {
            req = req
                .header("cf-access-client-id", id)
                .header("cf-access-client-secret", secret);
        }
        req
    }

    /// Fetch and validate `/health`, serving a cached verdict within the TTL.
    pub async fn health_check(&self) -> Result<ValidatedHealth> {
        let key = HealthCache::cache_key(
            self.config.base_url.as_str(),
            self.config.expected_image_id.as_deref(),
        );
        if let Some(cached) = self.health_cache.get(&key) {
            return Ok(cached);
        }

        let url = self.endpoint("/health")?;
        let response = self.authed(self.http.get(url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProverClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let wire: HealthWire = response
            .json()
            .await
            .map_err(|e| ProverClientError::Schema(format!("health body: {e}")))?;
        let health = validate_health(wire, self.config.expected_image_id.as_deref())?;

        debug!(image_id = %health.image_id, ruleset = %health.ruleset, "prover health validated");
        self.health_cache.put(key, health.clone());
        Ok(health)
    }

    /// Submit a tape for proving. Always health-gated; the outcome is
    /// pre-classified so callers never inspect HTTP details.
    pub async fn submit_tape(&self, tape: &[u8], segment_limit_po2: u32) -> SubmitOutcome {
        if let Err(e) = self.health_check().await {
            return if e.is_retryable() {
                SubmitOutcome::Retry(e.to_string())
            } else {
                SubmitOutcome::Fatal(e.to_string())
            };
        }

        let url = match self.endpoint("/api/jobs/prove-tape/raw") {
            Ok(url) => url,
            Err(e) => return SubmitOutcome::Fatal(e.to_string()),
        };

        let segment_limit = segment_limit_po2.to_string();
        let max_frames = self.config.max_frames.to_string();
        let request = self
            .authed(self.http.post(url))
            .query(&[
                ("receipt_kind", self.config.receipt_kind.as_str()),
                ("segment_limit_po2", segment_limit.as_str()),
                ("max_frames", max_frames.as_str()),
                (
                    "verify_receipt",
                    if self.config.verify_receipt { "true" } else { "false" },
                ),
            ])
            .header("content-type", "application/octet-stream")
            .body(tape.to_vec());

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return SubmitOutcome::Retry(format!("prover submit failed: {e}")),
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify_submit_response(status, &body, segment_limit_po2)
    }

    /// One status poll for a prover job id.
    pub async fn poll_once(&self, prover_job_id: &str) -> PollOutcome {
        let url = match self.endpoint(&format!("/api/jobs/{prover_job_id}")) {
            Ok(url) => url,
            Err(e) => return PollOutcome::Fatal(e.to_string()),
        };

        let response = match self.authed(self.http.get(url)).send().await {
            Ok(r) => r,
            Err(e) => {
                return PollOutcome::Retry {
                    message: format!("prover poll failed: {e}"),
                    clear_prover_job: false,
                }
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify_poll_response(status, &body, &self.config.retryable_error_codes)
    }

    /// Poll repeatedly, sleeping `interval` between attempts, until the
    /// prover answers or the wall-clock `budget` runs out. A zero budget
    /// returns `Running` without touching the network.
    pub async fn poll_bounded(
        &self,
        prover_job_id: &str,
        budget: Duration,
        interval: Duration,
    ) -> PollOutcome {
        if budget.is_zero() {
            return PollOutcome::Running(None);
        }

        let started = std::time::Instant::now();
        let mut last_status: Option<ProverStatus> = None;

        loop {
            match self.poll_once(prover_job_id).await {
                PollOutcome::Running(status) => {
                    last_status = status.or(last_status);
                    if started.elapsed() + interval >= budget {
                        return PollOutcome::Running(last_status);
                    }
                    tokio::time::sleep(interval).await;
                }
                other => return other,
            }
            if started.elapsed() >= budget {
                return PollOutcome::Running(last_status);
            }
        }
    }

    /// Build the stored summary from a successful poll, gating on the rules
    /// digest the prover committed.
    pub fn summarize(&self, success: &ProverSuccess) -> Result<ResultSummary> {
        if success.journal.rules_digest != EXPECTED_RULES_DIGEST {
            return Err(ProverClientError::RulesDigestMismatch {
                found: success.journal.rules_digest,
                expected: EXPECTED_RULES_DIGEST,
            });
        }
        Ok(success.summary())
    }
}

fn classify_submit_response(
    status: StatusCode,
    body: &str,
    segment_limit_po2: u32,
) -> SubmitOutcome {
    if status.as_u16() == 429 || status.is_server_error() {
        return SubmitOutcome::Retry(format!("prover returned HTTP {}", status.as_u16()));
    }
    if status.is_client_error() {
        if status == StatusCode::NOT_FOUND {
            return SubmitOutcome::Retry("prover submit endpoint returned 404".to_string());
        }
        return SubmitOutcome::Fatal(format!(
            "prover rejected submission with HTTP {}: {}",
            status.as_u16(),
            truncate(body, 256)
        ));
    }

    match serde_json::from_str::<JobCreatedWire>(body) {
        Ok(wire) if !wire.job_id.is_empty() => SubmitOutcome::Accepted(SubmitAccepted {
            prover_job_id: wire.job_id,
            status_url: wire.status_url,
            segment_limit_po2,
        }),
        Ok(_) => SubmitOutcome::Retry("prover accepted submission without a job id".to_string()),
        Err(e) => {
            warn!("malformed prover submit response: {e}");
            SubmitOutcome::Retry(format!("malformed prover submit response: {e}"))
        }
    }
}

fn classify_poll_response(
    status: StatusCode,
    body: &str,
    retryable_error_codes: &[String],
) -> PollOutcome {
    if status == StatusCode::NOT_FOUND {
        return PollOutcome::Retry {
            message: "prover no longer knows this job".to_string(),
            clear_prover_job: true,
        };
    }
    if status.as_u16() == 429 || status.is_server_error() {
        return PollOutcome::Retry {
            message: format!("prover returned HTTP {}", status.as_u16()),
            clear_prover_job: false,
        };
    }
    if status.is_client_error() {
        return PollOutcome::Fatal(format!(
            "prover poll rejected with HTTP {}: {}",
            status.as_u16(),
            truncate(body, 256)
        ));
    }

    let raw: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            return PollOutcome::Retry {
                message: format!("malformed prover poll response: {e}"),
                clear_prover_job: false,
            }
        }
    };
    let wire: JobStatusWire = match serde_json::from_value(raw.clone()) {
        Ok(w) => w,
        Err(e) => {
            return PollOutcome::Retry {
                message: format!("malformed prover poll response: {e}"),
                clear_prover_job: false,
            }
        }
    };

    match parse_prover_status(&wire.status) {
        Some(ProverStatus::Queued) => PollOutcome::Running(Some(ProverStatus::Queued)),
        Some(ProverStatus::Running) => PollOutcome::Running(Some(ProverStatus::Running)),
        Some(ProverStatus::Failed) => {
            let message = wire
                .error
                .unwrap_or_else(|| "prover reported failure without detail".to_string());
            let code = wire.error_code.unwrap_or_default();
            if retryable_error_codes.iter().any(|c| c == &code) {
                PollOutcome::Retry {
                    message: format!("prover failed with retryable code {code}: {message}"),
                    clear_prover_job: true,
                }
            } else {
                PollOutcome::Fatal(message)
            }
        }
        Some(ProverStatus::Succeeded) => match extract_success(raw, wire) {
            Some(success) => PollOutcome::Success(Box::new(success)),
            None => PollOutcome::Retry {
                message: "prover reported success with an incomplete payload".to_string(),
                clear_prover_job: true,
            },
        },
        None => PollOutcome::Fatal(format!("prover reported unknown status {:?}", wire.status)),
    }
}

/// A success is only a success when the payload is complete: proof with
/// journal, receipt, stats, and an elapsed time.
fn extract_success(raw: serde_json::Value, wire: JobStatusWire) -> Option<ProverSuccess> {
    let result = wire.result?;
    let elapsed_ms = result.elapsed_ms?;
    let proof = result.proof?;
    proof.receipt.as_ref()?;

    Some(ProverSuccess {
        raw,
        elapsed_ms,
        journal: proof.journal.into(),
        requested_receipt_kind: proof.requested_receipt_kind,
        produced_receipt_kind: proof.produced_receipt_kind,
        stats: proof.stats.into(),
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
