//! Error taxonomy of the tracking core.

use thiserror::Error;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, HarvesterError>;

/// Which remote collaborator produced an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Issues,
    Billing,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Issues => "issue tracker",
            Service::Billing => "billing",
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum HarvesterError {
    /// Network, auth or protocol failure talking to a remote service.
    #[error("{service} request failed: {message}")]
    Upstream { service: Service, message: String },
    #[error("project for {key} has no \"Coding\" task assignment")]
    NoCodingTask { key: String },
    #[error("no timer with key {key}")]
    UnknownTimer { key: String },
    #[error("timer state is inconsistent: {0}")]
    InvariantViolation(String),
    #[error("local storage error: {0}")]
    Persistence(#[from] StoreError),
    #[error("scheduler is not running")]
    SchedulerClosed,
}

impl HarvesterError {
    pub fn upstream(service: Service, message: impl Into<String>) -> Self {
        HarvesterError::Upstream {
            service,
            message: message.into(),
        }
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, HarvesterError::Upstream { .. })
    }
}
