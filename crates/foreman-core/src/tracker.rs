//! Work-item model and the upstream tracker seam.
//!
//! The scheduler only ever talks to [`Tracker`]; the stock implementation
//! shells out to the `gh` CLI so no HTTP client or token plumbing lives here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{ForemanError, Result};

/// Label applied to items the scheduler gives up on.
pub const BLOCKED_LABEL: &str = "foreman:blocked";

/// Label marking an item some other actor is already working.
pub const IN_PROGRESS_LABEL: &str = "in-progress";

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    Open,
    Closed,
}

/// An upstream tracker record. Immutable from the scheduler's perspective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub state: IssueState,
    #[serde(default)]
    pub assignees: Vec<String>,
}

impl WorkItem {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
    }
}

// ---------------------------------------------------------------------------
// Tracker seam
// ---------------------------------------------------------------------------

/// Upstream tracker operations the scheduler depends on.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Open items carrying the given run label.
    async fn list_open_items(&self, label: &str) -> Result<Vec<WorkItem>>;

    /// Current state of one item.
    async fn item_state(&self, number: u64) -> Result<IssueState>;

    /// True when the item is assigned or labelled as already in progress.
    async fn is_claimed_upstream(&self, number: u64) -> Result<bool>;

    /// Post a comment on the item.
    async fn comment(&self, number: u64, body: &str) -> Result<()>;

    /// Close the item.
    async fn close(&self, number: u64) -> Result<()>;

    /// Add a label to the item.
    async fn add_label(&self, number: u64, label: &str) -> Result<()>;

    /// How many times the item has been closed and reopened.
    async fn reopen_count(&self, number: u64) -> Result<u32>;

    /// Best-effort project-board status update.
    async fn set_board_status(&self, number: u64, status: &str) -> Result<()>;

    /// Best-effort project-board branch-field update.
    async fn set_board_branch(&self, number: u64, branch: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// gh-CLI implementation
// ---------------------------------------------------------------------------

/// Tracker backed by the GitHub CLI, operating on the repo at `repo_root`.
pub struct GhTracker {
    repo_root: std::path::PathBuf,
}

impl GhTracker {
    pub fn new(repo_root: std::path::PathBuf) -> Self {
        Self { repo_root }
    }

    async fn gh(&self, args: &[&str]) -> Result<String> {
        debug!(?args, "running gh command");
        let output = Command::new("gh")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await
            .map_err(|e| ForemanError::Tracker(format!("failed to execute gh: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ForemanError::Tracker(format!("gh {args:?} failed: {stderr}")));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Shape of `gh issue view/list --json` records.
#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
    state: String,
    #[serde(default)]
    assignees: Vec<GhAssignee>,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhAssignee {
    login: String,
}

impl From<GhIssue> for WorkItem {
    fn from(issue: GhIssue) -> Self {
        WorkItem {
            number: issue.number,
            title: issue.title,
            body: issue.body,
            labels: issue.labels.into_iter().map(|l| l.name).collect(),
            state: if issue.state.eq_ignore_ascii_case("closed") {
                IssueState::Closed
            } else {
                IssueState::Open
            },
            assignees: issue.assignees.into_iter().map(|a| a.login).collect(),
        }
    }
}

const ISSUE_JSON_FIELDS: &str = "number,title,body,labels,state,assignees";

#[async_trait]
impl Tracker for GhTracker {
    async fn list_open_items(&self, label: &str) -> Result<Vec<WorkItem>> {
        let stdout = self
            .gh(&[
                "issue", "list", "--state", "open", "--label", label, "--json",
                ISSUE_JSON_FIELDS,
            ])
            .await?;
        let issues: Vec<GhIssue> = serde_json::from_str(&stdout)
            .map_err(|e| ForemanError::Tracker(format!("failed to parse issue list: {e}")))?;
        Ok(issues.into_iter().map(WorkItem::from).collect())
    }

    async fn item_state(&self, number: u64) -> Result<IssueState> {
        let issue = self.view(number).await?;
        Ok(WorkItem::from(issue).state)
    }

    async fn is_claimed_upstream(&self, number: u64) -> Result<bool> {
        let item = WorkItem::from(self.view(number).await?);
        Ok(!item.assignees.is_empty() || item.has_label(IN_PROGRESS_LABEL))
    }

    async fn comment(&self, number: u64, body: &str) -> Result<()> {
        let number = number.to_string();
        self.gh(&["issue", "comment", &number, "--body", body]).await?;
        Ok(())
    }

    async fn close(&self, number: u64) -> Result<()> {
        let number = number.to_string();
        self.gh(&["issue", "close", &number]).await?;
        Ok(())
    }

    async fn add_label(&self, number: u64, label: &str) -> Result<()> {
        let number = number.to_string();
        self.gh(&["issue", "edit", &number, "--add-label", label]).await?;
        Ok(())
    }

    async fn reopen_count(&self, number: u64) -> Result<u32> {
        let endpoint = format!("repos/{{owner}}/{{repo}}/issues/{number}/events");
        let stdout = self.gh(&["api", &endpoint, "--paginate"]).await?;
        let events: Vec<serde_json::Value> = serde_json::from_str(&stdout)
            .map_err(|e| ForemanError::Tracker(format!("failed to parse issue events: {e}")))?;
        let count = events
            .iter()
            .filter(|e| e.get("event").and_then(|v| v.as_str()) == Some("reopened"))
            .count();
        Ok(count as u32)
    }

    async fn set_board_status(&self, number: u64, status: &str) -> Result<()> {
        // Project boards vary per installation; failures here are advisory.
        if let Err(e) = self
            .gh(&["issue", "edit", &number.to_string(), "--add-label", &format!("status:{status}")])
            .await
        {
            warn!(number, status, error = %e, "board status update failed");
        }
        Ok(())
    }

    async fn set_board_branch(&self, number: u64, branch: &str) -> Result<()> {
        if let Err(e) = self
            .comment(number, &format!("Working branch: `{branch}`"))
            .await
        {
            warn!(number, branch, error = %e, "board branch update failed");
        }
        Ok(())
    }
}

impl GhTracker {
    async fn view(&self, number: u64) -> Result<GhIssue> {
        let number = number.to_string();
        let stdout = self
            .gh(&["issue", "view", &number, "--json", ISSUE_JSON_FIELDS])
            .await?;
        serde_json::from_str(&stdout)
            .map_err(|e| ForemanError::Tracker(format!("failed to parse issue view: {e}")))
    }
}
