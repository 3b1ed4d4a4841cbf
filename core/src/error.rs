use thiserror::Error;

#[derive(Error, Debug)]
pub enum R360Error {
    #[error("Source unavailable: query '{query}' failed: {reason}")]
    SourceUnavailable { query: String, reason: String },

    #[error("Data integrity error in {record_set}: {detail}")]
    DataIntegrity { record_set: String, detail: String },

    #[error("Reconciliation ambiguity in {mode} mode: cannot order prior keys {keys:?}")]
    ReconciliationAmbiguity { mode: String, keys: Vec<String> },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Column '{column}' not found in dataset")]
    MissingColumn { column: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl R360Error {
    pub fn integrity(record_set: &str, detail: impl Into<String>) -> Self {
        R360Error::DataIntegrity {
            record_set: record_set.to_string(),
            detail: detail.into(),
        }
    }

    /// Only source outages are worth retrying; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, R360Error::SourceUnavailable { .. })
    }
}

pub type R360Result<T> = Result<T, R360Error>;
