use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    #[serde(default)]
    pub issues: Vec<JiraIssue>,
    #[serde(default)]
    pub start_at: u32,
    #[serde(default)]
    pub max_results: u32,
    #[serde(default)]
    pub total: u32,
}

impl SearchResponse {
    /// Offset of the next page, if the server reported more results.
    pub fn next_start(&self) -> Option<u32> {
        let fetched = self.start_at.saturating_add(self.issues.len() as u32);
        if self.issues.is_empty() || fetched >= self.total {
            None
        } else {
            Some(fetched)
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct JiraIssue {
    #[serde(default)]
    pub id: Option<String>,
    pub key: String,
    #[serde(default)]
    pub fields: IssueFields,
}

impl JiraIssue {
    pub fn summary(&self) -> &str {
        self.fields.summary.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IssueFields {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub status: Option<IssueStatus>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IssueStatus {
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest<'a> {
    pub jql: &'a str,
    pub start_at: u32,
    pub max_results: u32,
    pub fields: &'a [&'a str],
}
