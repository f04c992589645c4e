use std::time::Duration;

pub const DEFAULT_HARVEST_API_BASE: &str = "https://api.harvestapp.com";
pub const DEFAULT_HARVEST_API_VERSION: &str = "v2";
pub const DEFAULT_JIRA_API_PATH: &str = "rest/api/2";
pub const DEFAULT_USER_AGENT: &str = "harvester";
pub const DEFAULT_COOLDOWN_MS: u64 = 150;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Transport knobs shared by both services.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpOptions {
    pub user_agent: String,
    pub cooldown: Duration,
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            cooldown: Duration::from_millis(DEFAULT_COOLDOWN_MS),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct JiraConfig {
    pub base_url: String,
    pub api_path: String,
    pub user: String,
    pub password: String,
    pub http: HttpOptions,
}

impl JiraConfig {
    pub fn new(
        base_url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_path: DEFAULT_JIRA_API_PATH.to_string(),
            user: user.into(),
            password: password.into(),
            http: HttpOptions::default(),
        }
    }

    pub fn with_api_path(mut self, path: impl Into<String>) -> Self {
        self.api_path = path.into();
        self
    }

    pub fn with_http_options(mut self, http: HttpOptions) -> Self {
        self.http = http;
        self
    }

    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.http.timeout = duration;
        self
    }

    pub fn api_root(&self) -> String {
        join_root(&self.base_url, &self.api_path)
    }

    /// Browser link for an issue key.
    pub fn browse_url(&self, issue_key: &str) -> String {
        format!("{}/browse/{}", self.base_url.trim_end_matches('/'), issue_key)
    }
}

#[derive(Clone, Debug)]
pub struct HarvestConfig {
    pub base_url: String,
    pub api_version: String,
    pub account_id: String,
    pub token: String,
    pub http: HttpOptions,
}

impl HarvestConfig {
    pub fn new(account_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_HARVEST_API_BASE.to_string(),
            api_version: DEFAULT_HARVEST_API_VERSION.to_string(),
            account_id: account_id.into(),
            token: token.into(),
            http: HttpOptions::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    pub fn with_http_options(mut self, http: HttpOptions) -> Self {
        self.http = http;
        self
    }

    pub fn with_cooldown(mut self, duration: Duration) -> Self {
        self.http.cooldown = duration;
        self
    }

    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.http.timeout = duration;
        self
    }

    pub fn api_root(&self) -> String {
        join_root(&self.base_url, &self.api_version)
    }
}

fn join_root(base_url: &str, path: &str) -> String {
    let path = path.trim_matches('/');
    if path.is_empty() {
        format!("{}/", base_url.trim_end_matches('/'))
    } else {
        format!("{}/{}/", base_url.trim_end_matches('/'), path)
    }
}
