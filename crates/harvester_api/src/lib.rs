//! Typed Jira and Harvest API clients used by the harvester time tracker.

pub mod config;
pub mod error;
pub mod harvest;
mod http;
pub mod jira;
pub mod models;
pub mod rate_limiter;

pub use config::{HarvestConfig, HttpOptions, JiraConfig};
pub use error::{ApiError, Result};
pub use harvest::{HarvestClient, TimeEntryQuery};
pub use jira::{JiraClient, ACTIVE_ISSUES_JQL};
pub use models::{
    Company, JiraIssue, NamedRef, ProjectAssignment, ProjectRef, TaskAssignment, TimeEntry,
};
pub use rate_limiter::RateLimiter;
pub use reqwest::Url;
