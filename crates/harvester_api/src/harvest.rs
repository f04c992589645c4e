//! Harvest v2 client covering company lookup, project assignments and time entries.

use crate::config::HarvestConfig;
use crate::error::{ApiError, Result};
use crate::http::{header_name, header_value, Transport};
use crate::models::{
    Company, ProjectAssignment, ProjectAssignmentsPage, TimeEntriesPage, TimeEntry,
    TimeEntryCreate, TimeEntryUpdate,
};
use crate::rate_limiter::RateLimiter;
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;
use tracing::warn;

const ACCOUNT_HEADER: &str = "harvest-account-id";
const PAGE_SIZE: u32 = 100;
const MAX_PAGES: u32 = 50;

#[derive(Clone)]
pub struct HarvestClient {
    transport: Transport,
    config: HarvestConfig,
}

/// Query for `GET /time_entries`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeEntryQuery {
    pub is_running: Option<bool>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl TimeEntryQuery {
    pub fn running() -> Self {
        Self {
            is_running: Some(true),
            ..Self::default()
        }
    }

    pub fn since(from: NaiveDate) -> Self {
        Self {
            from: Some(from),
            ..Self::default()
        }
    }

    fn params(&self, page: u32) -> Vec<(&'static str, String)> {
        let mut params = vec![("page", page.to_string()), ("per_page", PAGE_SIZE.to_string())];
        if let Some(running) = self.is_running {
            params.push(("is_running", running.to_string()));
        }
        if let Some(from) = self.from {
            params.push(("from", from.format("%Y-%m-%d").to_string()));
        }
        if let Some(to) = self.to {
            params.push(("to", to.format("%Y-%m-%d").to_string()));
        }
        params
    }
}

impl HarvestClient {
    pub fn new(config: HarvestConfig) -> Result<Self> {
        let limiter = RateLimiter::new(config.http.cooldown);
        Self::new_with_limiter(config, limiter)
    }

    pub fn new_with_limiter(config: HarvestConfig, limiter: RateLimiter) -> Result<Self> {
        if config.account_id.trim().is_empty() || config.token.trim().is_empty() {
            return Err(ApiError::InvalidConfig(
                "harvest account id and token are required".to_string(),
            ));
        }
        let mut headers = HeaderMap::new();
        let mut auth = header_value(&format!("Bearer {}", config.token.trim()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            header_name(ACCOUNT_HEADER),
            header_value(config.account_id.trim())?,
        );
        let transport = Transport::new(config.api_root(), &config.http, headers, limiter)?;
        Ok(Self { transport, config })
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        self.transport.limiter()
    }

    pub async fn get_company(&self) -> Result<Company> {
        self.transport.get("company", &[]).await
    }

    pub async fn list_time_entries(&self, query: &TimeEntryQuery) -> Result<Vec<TimeEntry>> {
        let mut entries = Vec::new();
        let mut page = 1;
        for _ in 0..MAX_PAGES {
            let response: TimeEntriesPage =
                self.transport.get("time_entries", &query.params(page)).await?;
            entries.extend(response.time_entries);
            match response.next_page {
                Some(next) if next > page => page = next,
                _ => return Ok(entries),
            }
        }
        warn!("time_entries stopped after {} pages", MAX_PAGES);
        Ok(entries)
    }

    pub async fn list_running_entries(&self) -> Result<Vec<TimeEntry>> {
        self.list_time_entries(&TimeEntryQuery::running()).await
    }

    pub async fn list_my_project_assignments(&self) -> Result<Vec<ProjectAssignment>> {
        let mut assignments = Vec::new();
        let mut page = 1;
        for _ in 0..MAX_PAGES {
            let params = [("page", page.to_string()), ("per_page", PAGE_SIZE.to_string())];
            let response: ProjectAssignmentsPage = self
                .transport
                .get("users/me/project_assignments", &params)
                .await?;
            assignments.extend(response.project_assignments);
            match response.next_page {
                Some(next) if next > page => page = next,
                _ => return Ok(assignments),
            }
        }
        warn!("project_assignments stopped after {} pages", MAX_PAGES);
        Ok(assignments)
    }

    /// Starts a running timer; Harvest treats a create without hours as a timer start.
    pub async fn start_timer(
        &self,
        project_id: u64,
        task_id: u64,
        spent_date: NaiveDate,
    ) -> Result<TimeEntry> {
        let payload = TimeEntryCreate {
            project_id,
            task_id,
            spent_date,
            hours: None,
        };
        self.transport
            .send(Method::POST, "time_entries", Some(&payload))
            .await
    }

    pub async fn stop_timer(&self, entry_id: u64) -> Result<TimeEntry> {
        let path = format!("time_entries/{}/stop", entry_id);
        self.transport
            .send(Method::PATCH, &path, Option::<&Value>::None)
            .await
    }

    pub async fn create_entry(
        &self,
        project_id: u64,
        task_id: u64,
        hours: f64,
        spent_date: NaiveDate,
    ) -> Result<TimeEntry> {
        let payload = TimeEntryCreate {
            project_id,
            task_id,
            spent_date,
            hours: Some(hours),
        };
        self.transport
            .send(Method::POST, "time_entries", Some(&payload))
            .await
    }

    pub async fn update_entry_hours(&self, entry_id: u64, hours: f64) -> Result<TimeEntry> {
        let path = format!("time_entries/{}", entry_id);
        let payload = TimeEntryUpdate { hours };
        self.transport
            .send(Method::PATCH, &path, Some(&payload))
            .await
    }
}
