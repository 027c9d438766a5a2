use std::path::PathBuf;

/// Run-level failures. Per-lead delivery failures never surface here; the
/// dispatcher records or logs them and moves on to the next lead.
#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Failed to load lead store {path}: {message}")]
    LeadStore { path: PathBuf, message: String },
    #[error("Ledger error: {0}")]
    Ledger(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Another dispatcher already holds the ledger lock: {0}")]
    AlreadyRunning(PathBuf),
    #[error("No lead or send outcome matches {0}")]
    UnknownLead(String),
}

impl CampaignError {
    pub fn config(message: impl Into<String>) -> Self {
        CampaignError::Configuration(message.into())
    }
}

pub type Result<T> = std::result::Result<T, CampaignError>;
