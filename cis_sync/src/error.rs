use std::error::Error as StdError;

/// Common error type for `cis_sync`.
///
/// Driver errors (sqlx, serde) keep their chain via `Error::backend`. The
/// read-only guard and the circuit breaker have dedicated variants so callers
/// can tell a policy rejection from a transient outage.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("sync disabled: {0}")]
    Disabled(String),

    #[error("read-only violation: {verb} statements are not permitted")]
    ReadOnlyViolation { verb: String, preview: String },

    #[error("query template is not allowlisted (fingerprint {fingerprint})")]
    QueryNotAllowed { fingerprint: String },

    #[error("circuit breaker open, retry after {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },

    #[error("external authentication failed: {0}")]
    AuthFailure(String),

    #[error("external query timed out after {0}ms")]
    Timeout(u64),

    #[error("external account holds write privileges: {}", .0.join(", "))]
    UnsafePrivileges(Vec<String>),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    #[tracing::instrument(level = "debug", name = "cis_sync.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Verb and allowlist rejections. Never retried, never counted by the breaker.
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            Self::ReadOnlyViolation { .. } | Self::QueryNotAllowed { .. }
        )
    }

    /// Transient external failures that accumulate toward the breaker threshold.
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Backend { .. } | Self::BackendMessage(_)
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Self::backend("sqlx", e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
