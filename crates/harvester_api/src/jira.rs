//! Jira REST client limited to the issue queries the tracker needs.

use crate::config::JiraConfig;
use crate::error::{ApiError, Result};
use crate::http::{header_value, Transport};
use crate::models::{JiraIssue, SearchRequest, SearchResponse};
use crate::rate_limiter::RateLimiter;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::Method;
use tracing::warn;

/// Issues assigned to the authenticated user that are still being worked on.
pub const ACTIVE_ISSUES_JQL: &str = "assignee = currentUser() \
    AND resolution = Unresolved \
    AND status not in (\"To Do\", \"Selected\") \
    ORDER BY updated DESC, status DESC";

const SEARCH_PAGE_SIZE: u32 = 100;
const SEARCH_FIELDS: [&str; 2] = ["summary", "status"];
/// Upper bound on pages walked by one search, guards against a server that never reports the end.
const MAX_SEARCH_PAGES: u32 = 20;

#[derive(Clone)]
pub struct JiraClient {
    transport: Transport,
    config: JiraConfig,
}

impl JiraClient {
    pub fn new(config: JiraConfig) -> Result<Self> {
        let limiter = RateLimiter::new(config.http.cooldown);
        Self::new_with_limiter(config, limiter)
    }

    pub fn new_with_limiter(config: JiraConfig, limiter: RateLimiter) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(ApiError::InvalidConfig("jira url is empty".to_string()));
        }
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, basic_auth(&config.user, &config.password)?);
        let transport = Transport::new(config.api_root(), &config.http, headers, limiter)?;
        Ok(Self { transport, config })
    }

    pub fn config(&self) -> &JiraConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        self.transport.limiter()
    }

    /// Runs a JQL search, following pagination until every match is collected.
    pub async fn search_issues(&self, jql: &str) -> Result<Vec<JiraIssue>> {
        let mut issues = Vec::new();
        let mut start_at = 0;
        for _ in 0..MAX_SEARCH_PAGES {
            let request = SearchRequest {
                jql,
                start_at,
                max_results: SEARCH_PAGE_SIZE,
                fields: &SEARCH_FIELDS,
            };
            let page: SearchResponse = self
                .transport
                .send(Method::POST, "search", Some(&request))
                .await?;
            let next = page.next_start();
            issues.extend(page.issues);
            match next {
                Some(offset) => start_at = offset,
                None => return Ok(issues),
            }
        }
        warn!(
            "Issue search stopped after {} pages; {} issues returned",
            MAX_SEARCH_PAGES,
            issues.len()
        );
        Ok(issues)
    }

    pub async fn list_active_issues(&self) -> Result<Vec<JiraIssue>> {
        self.search_issues(ACTIVE_ISSUES_JQL).await
    }

    pub fn api_root(&self) -> &str {
        self.transport.api_root()
    }
}

fn basic_auth(user: &str, password: &str) -> Result<reqwest::header::HeaderValue> {
    let encoded = BASE64_STANDARD.encode(format!("{}:{}", user, password));
    let mut value = header_value(&format!("Basic {}", encoded))?;
    value.set_sensitive(true);
    Ok(value)
}
