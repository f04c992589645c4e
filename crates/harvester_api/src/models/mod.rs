mod harvest;
mod jira;

pub use harvest::{
    Company, NamedRef, ProjectAssignment, ProjectAssignmentsPage, ProjectRef, TaskAssignment,
    TimeEntry, TimeEntryCreate, TimeEntryUpdate, TimeEntriesPage, UserAssignmentRef,
};
pub use jira::{IssueFields, IssueStatus, JiraIssue, SearchRequest, SearchResponse};
