//! Application error types shared across all layers.

use thiserror::Error;

/// Top-level application error
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication required: {0}")]
    Unauthenticated(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Payment is not retryable: {0}")]
    NotRetryable(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// True for provider errors the status-polling path absorbs as `pending`
    /// instead of surfacing (the timeout watcher guarantees resolution).
    pub fn is_transient_provider(&self) -> bool {
        matches!(
            self,
            Self::Provider(ProviderError::NoAnswer(_))
                | Self::Provider(ProviderError::Unreachable(_))
                | Self::Provider(ProviderError::Credential(_))
        )
    }
}

/// Input validation failures, rejected before any provider call
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid {field}: {message}")]
    InvalidField { field: String, message: String },

    #[error("{0}")]
    Invalid(String),
}

impl From<validator::ValidationErrors> for ValidationError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let detail = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| {
                    e.message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("Invalid {}", field))
                })
            })
            .collect::<Vec<_>>()
            .join("; ");
        Self::Invalid(detail)
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Validation(errors.into())
    }
}

/// Persistence failures
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Connection(error.to_string())
            }
            _ => Self::Query(error.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DatabaseError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::Migration(error.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        Self::Database(error.into())
    }
}

/// Failures talking to the mobile-money provider
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network-level failure or timeout reaching the provider
    #[error("Provider unreachable: {0}")]
    Unreachable(String),

    /// Provider synchronously refused the push; no ledger record exists
    #[error("Provider rejected the request: {0}")]
    Rejected(String),

    /// Status query inconclusive, push still outstanding on the provider side
    #[error("Provider has no answer yet: {0}")]
    NoAnswer(String),

    /// Credential fetch failed or the provider rejected our token
    #[error("Provider credentials rejected: {0}")]
    Credential(String),

    /// Response body did not match the documented shape
    #[error("Unexpected provider response: {0}")]
    UnexpectedResponse(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        Self::Unreachable(error.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        Self::Provider(error.into())
    }
}

/// Startup configuration failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidVar { var: String, message: String },
}
