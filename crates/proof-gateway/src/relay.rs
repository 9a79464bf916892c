//! Client for the on-chain settlement relayer. The relayer signs and
//! submits the actual chain transaction; the gateway only hands it the
//! claimant address, the seal, and the raw journal, and records the
//! resulting transaction hash.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub endpoint: Url,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub enum RelayOutcome {
    Success { tx_hash: String },
    Transient(String),
    Fatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayErrorKind {
    Transient,
    Fatal,
}

/// Fatal markers are contract-level rejections that no retry will fix.
const FATAL_MARKERS: [&str; 5] = [
    "hosterror",
    "error(contract",
    "trustline",
    "op_no_account",
    "missing account",
];

/// Transient markers cover infrastructure trouble between us and the chain.
const TRANSIENT_MARKERS: [&str; 8] = [
    "fetch",
    "network",
    "timeout",
    "timed out",
    "connection",
    "rpc request failed",
    "internal error; reference =",
    "simulation_failed",
];

/// Substring classification of relayer error messages. Fatal markers win;
/// anything unrecognized is treated as transient so unfamiliar relayer
/// wording exhausts the retry budget instead of bricking the claim outright.
pub fn classify_relay_error(message: &str) -> RelayErrorKind {
    let lower = message.to_lowercase();
    if FATAL_MARKERS.iter().any(|m| lower.contains(m)) {
        return RelayErrorKind::Fatal;
    }
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return RelayErrorKind::Transient;
    }
    RelayErrorKind::Transient
}

#[derive(Debug, Serialize)]
struct RelayRequestBody<'a> {
    claimant_address: &'a str,
    seal: String,
    journal: String,
}

#[derive(Debug, Deserialize)]
struct RelayResponseBody {
    #[serde(default, alias = "hash")]
    tx_hash: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct RelayClient {
    http: reqwest::Client,
    config: RelayConfig,
}

impl RelayClient {
    pub fn new(config: RelayConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(RelayClient { http, config })
    }

    pub async fn submit_claim(
        &self,
        claimant_address: &str,
        seal: &[u8],
        journal_raw: &[u8],
    ) -> RelayOutcome {
        let body = RelayRequestBody {
            claimant_address,
            seal: hex::encode(seal),
            journal: hex::encode(journal_raw),
        };

        let mut request = self.http.post(self.config.endpoint.clone()).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("x-api-key", key);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return RelayOutcome::Transient(format!("relay request failed: {e}")),
        };

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if status.as_u16() == 429 || status.is_server_error() {
            return RelayOutcome::Transient(format!(
                "relay returned HTTP {}: {}",
                status.as_u16(),
                truncate(&text, 256)
            ));
        }

        let parsed: RelayResponseBody = match serde_json::from_str(&text) {
            Ok(p) => p,
            Err(e) => {
                return RelayOutcome::Transient(format!("malformed relay response: {e}"));
            }
        };

        if status.is_success() {
            if let Some(tx_hash) = parsed.tx_hash.filter(|h| !h.is_empty()) {
                return RelayOutcome::Success { tx_hash };
            }
        }

        let message = parsed
            .error
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| format!("relay returned HTTP {}", status.as_u16()));
        match classify_relay_error(&message) {
            RelayErrorKind::Transient => RelayOutcome::Transient(message),
            RelayErrorKind::Fatal => RelayOutcome::Fatal(message),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
