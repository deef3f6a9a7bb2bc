//! Engine prompt assembly and the lessons-propagation seam.

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::Domain;
use crate::tracker::WorkItem;
use crate::Result;

const LESSONS_FILE: &str = "LESSONS.md";

/// Build the prompt handed to an engine for one attempt.
pub fn build_prompt(
    item: &WorkItem,
    domain: Domain,
    preamble: &str,
    lessons: Option<&str>,
) -> String {
    let mut prompt = String::new();
    if !preamble.trim().is_empty() {
        prompt.push_str(preamble.trim());
        prompt.push_str("\n\n");
    }
    prompt.push_str(&format!("Issue #{}: {}\n", item.number, item.title));
    prompt.push_str(&format!("Domain: {domain}\n\n"));
    if !item.body.trim().is_empty() {
        prompt.push_str(item.body.trim());
        prompt.push('\n');
    }
    if let Some(lessons) = lessons {
        if !lessons.trim().is_empty() {
            prompt.push_str("\n## Lessons from previous runs\n\n");
            prompt.push_str(lessons.trim());
            prompt.push('\n');
        }
    }
    prompt
}

/// Repo-level context that travels into each workspace and back.
#[async_trait]
pub trait LessonStore: Send + Sync {
    /// Copy lessons into the workspace; returns the text for the prompt.
    async fn propagate(&self, repo_root: &Path, workspace: &Path) -> Result<Option<String>>;

    /// Fold workspace-side lesson edits back into the repo copy.
    async fn merge_back(&self, repo_root: &Path, workspace: &Path) -> Result<()>;
}

/// File-based store over a `LESSONS.md` at the repo root.
pub struct FileLessons;

#[async_trait]
impl LessonStore for FileLessons {
    async fn propagate(&self, repo_root: &Path, workspace: &Path) -> Result<Option<String>> {
        let source = repo_root.join(LESSONS_FILE);
        if !source.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&source).await?;
        tokio::fs::write(workspace.join(LESSONS_FILE), &content).await?;
        debug!(bytes = content.len(), "propagated lessons into workspace");
        Ok(Some(content))
    }

    async fn merge_back(&self, repo_root: &Path, workspace: &Path) -> Result<()> {
        let ws_file = workspace.join(LESSONS_FILE);
        if !ws_file.exists() {
            return Ok(());
        }
        let ws_content = tokio::fs::read_to_string(&ws_file).await?;

        let repo_file = repo_root.join(LESSONS_FILE);
        let repo_content = if repo_file.exists() {
            tokio::fs::read_to_string(&repo_file).await?
        } else {
            String::new()
        };
        if ws_content == repo_content {
            return Ok(());
        }

        let merged = format!(
            "{}\n<!-- merged from workspace {} -->\n{}\n",
            repo_content.trim_end(),
            chrono::Utc::now().to_rfc3339(),
            ws_content.trim()
        );
        tokio::fs::write(&repo_file, merged).await?;
        debug!("merged workspace lessons back into repo");
        Ok(())
    }
}

/// Store that carries nothing. Used by tests and minimal setups.
pub struct NoLessons;

#[async_trait]
impl LessonStore for NoLessons {
    async fn propagate(&self, _repo_root: &Path, _workspace: &Path) -> Result<Option<String>> {
        Ok(None)
    }

    async fn merge_back(&self, _repo_root: &Path, _workspace: &Path) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::IssueState;

    fn item() -> WorkItem {
        WorkItem {
            number: 42,
            title: "Add index".into(),
            body: "The orders table needs an index.".into(),
            labels: vec!["backend".into()],
            state: IssueState::Open,
            assignees: vec![],
        }
    }

    #[test]
    fn prompt_contains_issue_and_domain() {
        let prompt = build_prompt(&item(), Domain::Backend, "", None);
        assert!(prompt.contains("Issue #42: Add index"));
        assert!(prompt.contains("Domain: backend"));
        assert!(prompt.contains("orders table"));
    }

    #[test]
    fn preamble_and_lessons_are_included() {
        let prompt = build_prompt(
            &item(),
            Domain::Backend,
            "Work in small commits.",
            Some("Avoid editing generated files."),
        );
        assert!(prompt.starts_with("Work in small commits."));
        assert!(prompt.contains("## Lessons from previous runs"));
        assert!(prompt.contains("Avoid editing generated files."));
    }

    #[tokio::test]
    async fn file_lessons_round_trip() {
        let repo = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();

        let store = FileLessons;
        assert!(store
            .propagate(repo.path(), ws.path())
            .await
            .unwrap()
            .is_none());

        tokio::fs::write(repo.path().join(LESSONS_FILE), "lesson one\n")
            .await
            .unwrap();
        let text = store.propagate(repo.path(), ws.path()).await.unwrap();
        assert_eq!(text.as_deref(), Some("lesson one\n"));
        assert!(ws.path().join(LESSONS_FILE).exists());

        // Unchanged workspace copy merges to a no-op.
        store.merge_back(repo.path(), ws.path()).await.unwrap();
        let repo_content = tokio::fs::read_to_string(repo.path().join(LESSONS_FILE))
            .await
            .unwrap();
        assert_eq!(repo_content, "lesson one\n");

        // Workspace edits are appended with provenance.
        tokio::fs::write(ws.path().join(LESSONS_FILE), "lesson one\nlesson two\n")
            .await
            .unwrap();
        store.merge_back(repo.path(), ws.path()).await.unwrap();
        let repo_content = tokio::fs::read_to_string(repo.path().join(LESSONS_FILE))
            .await
            .unwrap();
        assert!(repo_content.contains("lesson two"));
        assert!(repo_content.contains("merged from workspace"));
    }
}
