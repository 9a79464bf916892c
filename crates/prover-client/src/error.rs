use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProverClientError>;

/// Errors from talking to the prover. `is_retryable` drives the caller's
/// retry-vs-fail decision: network trouble and server-side pressure are
/// worth retrying, compatibility and schema problems are not.
#[derive(Debug, Error)]
pub enum ProverClientError {
    #[error("prover request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("prover returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("prover response did not match the expected schema: {0}")]
    Schema(String),

    #[error("prover health check failed: rules_digest mismatch (prover reports {found:#010x}, expected {expected:#010x})")]
    RulesDigestMismatch { found: u32, expected: u32 },

    #[error("prover health check failed: image_id {found} does not match pinned {expected}")]
    ImageIdMismatch { found: String, expected: String },

    #[error("prover health check failed: {0}")]
    HealthInvalid(String),
}

impl ProverClientError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProverClientError::Transport(_) => true,
            ProverClientError::Status { status, .. } => {
                *status == 429 || *status >= 500
            }
            ProverClientError::Schema(_)
            | ProverClientError::RulesDigestMismatch { .. }
            | ProverClientError::ImageIdMismatch { .. }
            | ProverClientError::HealthInvalid(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        assert!(ProverClientError::Status {
            status: 429,
            body: String::new()
        }
        .is_retryable());
        assert!(ProverClientError::Status {
            status: 503,
            body: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn client_errors_and_mismatches_are_fatal() {
        assert!(!ProverClientError::Status {
            status: 400,
            body: String::new()
        }
        .is_retryable());
        assert!(!ProverClientError::RulesDigestMismatch {
            found: 1,
            expected: 2
        }
        .is_retryable());
        assert!(!ProverClientError::Schema("bad".into()).is_retryable());
    }
}
