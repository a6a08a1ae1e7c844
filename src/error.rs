//! Error types for inoculate-rs.

use thiserror::Error;

/// Result type alias for inoculate-rs operations.
pub type Result<T> = std::result::Result<T, InoculateError>;

/// Errors that can occur in inoculate-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum InoculateError {
    /// Configuration error (missing fields, invalid values, missing credentials).
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// Dataset error (missing file, malformed record).
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Training error, with the underlying backend failure attached when known.
    #[error("training error: {message}")]
    Training {
        /// What went wrong.
        message: String,
        /// Underlying cause from the training backend, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Generation error (runtime failure while producing a response).
    #[error("generation error: {0}")]
    Generation(String),

    /// Judge error (scoring API failure that could not be degraded to unscored).
    #[error("judge error: {0}")]
    Judge(String),

    /// CSV read/write error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// HTTP transport error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(#[from] indicatif::style::TemplateError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl InoculateError {
    /// Training error with no attached cause.
    pub fn training(message: impl Into<String>) -> Self {
        Self::Training {
            message: message.into(),
            source: None,
        }
    }

    /// Training error wrapping an underlying backend failure.
    pub fn training_caused_by(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Training {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}
