use thiserror::Error;
use uuid::Uuid;

pub type CampaignResult<T> = Result<T, CampaignError>;

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Template rendering error: {0}")]
    Render(String),
}

impl CampaignError {
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        CampaignError::NotFound { kind, id }
    }
}

impl From<config::ConfigError> for CampaignError {
    fn from(e: config::ConfigError) -> Self {
        CampaignError::Config(e.to_string())
    }
}
