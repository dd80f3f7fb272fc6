//! stockmeta - batch stock-photo metadata generation against a generative vision API
//!
//! Walks a set of images, asks a remote vision model for a
//! title/description/keyword triple per image, normalizes and validates the
//! result, tracks per-row state in a persisted store, and exports accepted
//! rows as CSV.

pub mod batch;
pub mod client;
pub mod config;
pub mod credentials;
pub mod export;
pub mod keywords;
pub mod resolver;
pub mod store;

pub use batch::{BatchRunner, BatchSummary, NoopPacer, Pacer, Progress, TokioPacer};
pub use client::{GeminiClient, ImageMetadata, MetadataClient};
pub use config::{Config, ConfigBuilder, PacingConfig, ValidationRules};
pub use credentials::{parse_credential_list, CredentialStore};
pub use resolver::{ApiVariant, ModelResolver, ResolvedModel};
pub use store::{ResultStore, Row, RowStatus};

/// Result type for metadata generation operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for metadata generation operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("quota exceeded: {message}")]
    QuotaExceeded {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("no callable model available for this credential")]
    NoModelAvailable,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("validation error: {0}")]
    Validation(String),
}

// reqwest errors render the request URL, and generation and listing URLs
// carry the credential as a query parameter. Strip the URL at conversion so
// the secret can never reach logs or the persisted row store.
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.without_url())
    }
}

impl Error {
    /// Only quota errors are eligible for credential rotation; everything
    /// else is fatal for the row regardless of how many credentials remain.
    pub fn is_quota(&self) -> bool {
        matches!(self, Error::QuotaExceeded { .. })
    }
}
