//! Workflow loading for endpoints, schedules, and webhook routes.
//!
//! A reference is either a path on disk (resolved against the data
//! directory) or a remote reference handled by the injected fetcher.

use std::path::PathBuf;
use std::sync::Arc;

use conductor_types::error::{CoreError, CoreResult};
use conductor_types::workflow::WorkflowDefinition;

use crate::fetcher::{BoxWorkflowFetcher, RemoteRef};
use crate::parser::WorkflowParser;

/// Loads workflow definitions from disk or a remote host.
pub struct WorkflowLoader {
    base_dir: PathBuf,
    parser: Arc<dyn WorkflowParser>,
    fetcher: Option<BoxWorkflowFetcher>,
}

impl WorkflowLoader {
    pub fn new(base_dir: PathBuf, parser: Arc<dyn WorkflowParser>) -> Self {
        Self {
            base_dir,
            parser,
            fetcher: None,
        }
    }

    pub fn with_fetcher(mut self, fetcher: BoxWorkflowFetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Resolve a reference to a parsed definition.
    pub async fn load(&self, reference: &str) -> CoreResult<WorkflowDefinition> {
        if RemoteRef::looks_remote(reference) {
            let remote = RemoteRef::parse(reference)?;
            let fetcher = self.fetcher.as_ref().ok_or_else(|| {
                CoreError::invalid_input(format!(
                    "remote reference '{reference}' given but no fetcher is configured"
                ))
            })?;
            let fetched = fetcher.fetch(&remote).await?;
            tracing::debug!(
                reference = %remote,
                commit = fetched.commit.as_str(),
                "fetched remote workflow"
            );
            return self.parser.parse(&fetched.bytes);
        }

        let path = if PathBuf::from(reference).is_absolute() {
            PathBuf::from(reference)
        } else {
            self.base_dir.join(reference)
        };
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            CoreError::not_found(format!("workflow '{}' not readable: {e}", path.display()))
        })?;
        self.parser.parse(&bytes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{FetchedWorkflow, WorkflowFetcher};
    use crate::parser::YamlWorkflowParser;
    use conductor_types::error::ErrorKind;

    fn loader(dir: &std::path::Path) -> WorkflowLoader {
        WorkflowLoader::new(dir.to_path_buf(), Arc::new(YamlWorkflowParser))
    }

    #[tokio::test]
    async fn test_load_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("workflows"))
            .await
            .unwrap();
        tokio::fs::write(
            dir.path().join("workflows/t.yaml"),
            "name: t\nsteps:\n  - id: a\n    type: noop\n",
        )
        .await
        .unwrap();

        let def = loader(dir.path()).load("workflows/t.yaml").await.unwrap();
        assert_eq!(def.name, "t");
    }

    #[tokio::test]
    async fn test_load_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = loader(dir.path()).load("nope.yaml").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_remote_without_fetcher_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = loader(dir.path())
            .load("github.com:acme/flows/wf.yaml")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    struct StaticFetcher;

    impl WorkflowFetcher for StaticFetcher {
        async fn fetch(&self, _reference: &RemoteRef) -> CoreResult<FetchedWorkflow> {
            Ok(FetchedWorkflow {
                bytes: b"name: remote\nsteps: []\n".to_vec(),
                commit: "abc123".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_remote_reference_uses_fetcher() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path()).with_fetcher(BoxWorkflowFetcher::new(StaticFetcher));
        let def = loader.load("github.com:acme/flows/wf.yaml@main").await.unwrap();
        assert_eq!(def.name, "remote");
    }
}
