//! Shared data model, configuration, errors and events for campaign dispatch.

pub mod config;
pub mod error;
pub mod event_bus;
pub mod templates;
pub mod types;

pub use config::AppConfig;
pub use error::{CampaignError, CampaignResult};
