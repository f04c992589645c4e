use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Clone)]
pub struct Company {
    pub base_uri: String,
    #[serde(default)]
    pub full_domain: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct NamedRef {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ProjectRef {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub struct UserAssignmentRef {
    #[serde(default)]
    pub is_project_manager: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TimeEntry {
    pub id: u64,
    pub spent_date: NaiveDate,
    #[serde(default)]
    pub hours: Option<f64>,
    #[serde(default)]
    pub is_running: bool,
    pub project: ProjectRef,
    pub task: NamedRef,
    #[serde(default)]
    pub user_assignment: Option<UserAssignmentRef>,
}

impl TimeEntry {
    pub fn hours(&self) -> f64 {
        self.hours.unwrap_or(0.0)
    }

    pub fn is_project_manager(&self) -> bool {
        self.user_assignment
            .as_ref()
            .map(|assignment| assignment.is_project_manager)
            .unwrap_or(false)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimeEntriesPage {
    #[serde(default)]
    pub time_entries: Vec<TimeEntry>,
    #[serde(default)]
    pub next_page: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TaskAssignment {
    pub id: u64,
    pub task: NamedRef,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ProjectAssignment {
    pub id: u64,
    #[serde(default)]
    pub is_project_manager: bool,
    pub project: ProjectRef,
    #[serde(default)]
    pub task_assignments: Vec<TaskAssignment>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectAssignmentsPage {
    #[serde(default)]
    pub project_assignments: Vec<ProjectAssignment>,
    #[serde(default)]
    pub next_page: Option<u32>,
}

/// Body for `POST /time_entries`; leaving `hours` out starts a running timer.
#[derive(Debug, Serialize, Clone)]
pub struct TimeEntryCreate {
    pub project_id: u64,
    pub task_id: u64,
    pub spent_date: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hours: Option<f64>,
}

#[derive(Debug, Serialize, Clone)]
pub struct TimeEntryUpdate {
    pub hours: f64,
}
