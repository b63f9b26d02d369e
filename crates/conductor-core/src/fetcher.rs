//! Remote workflow references.
//!
//! Reference syntax: `<host>:<owner>/<repo>[/<path>][@<ref>]`, e.g.
//! `github.com:acme/workflows/deploy.yaml@v2`. Parsing is concrete here;
//! fetching is a capability the host injects (`WorkflowFetcher`).

use std::future::Future;
use std::pin::Pin;

use conductor_types::error::{CoreError, CoreResult};

/// A parsed remote workflow reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRef {
    pub host: String,
    pub owner: String,
    pub repo: String,
    /// Path within the repository, when given.
    pub path: Option<String>,
    /// Branch, tag, or commit; defaults to the host's default branch.
    pub git_ref: Option<String>,
}

impl RemoteRef {
    /// Whether a string looks like a remote reference rather than a local
    /// path (contains a host separator).
    pub fn looks_remote(reference: &str) -> bool {
        reference.contains(':')
    }

    pub fn parse(reference: &str) -> CoreResult<Self> {
        let (host, rest) = reference
            .split_once(':')
            .ok_or_else(|| CoreError::invalid_input(format!("not a remote reference: '{reference}'")))?;
        if host.is_empty() {
            return Err(CoreError::invalid_input("remote reference host is empty"));
        }

        let (repo_part, git_ref) = match rest.rsplit_once('@') {
            Some((repo_part, r)) if !r.is_empty() => (repo_part, Some(r.to_string())),
            Some(_) => {
                return Err(CoreError::invalid_input(format!(
                    "empty ref in remote reference: '{reference}'"
                )));
            }
            None => (rest, None),
        };

        let mut segments = repo_part.split('/');
        let owner = segments.next().unwrap_or_default();
        let repo = segments.next().unwrap_or_default();
        if owner.is_empty() || repo.is_empty() {
            return Err(CoreError::invalid_input(format!(
                "remote reference must be <host>:<owner>/<repo>[/<path>][@<ref>]: '{reference}'"
            )));
        }
        let path: Vec<&str> = segments.collect();
        let path = if path.is_empty() {
            None
        } else {
            Some(path.join("/"))
        };

        Ok(Self {
            host: host.to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            path,
            git_ref,
        })
    }
}

impl std::fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.owner, self.repo)?;
        if let Some(path) = &self.path {
            write!(f, "/{path}")?;
        }
        if let Some(git_ref) = &self.git_ref {
            write!(f, "@{git_ref}")?;
        }
        Ok(())
    }
}

/// Workflow bytes pinned to a commit.
#[derive(Debug, Clone)]
pub struct FetchedWorkflow {
    pub bytes: Vec<u8>,
    /// The commit identifier the reference resolved to.
    pub commit: String,
}

/// Fetches workflow bytes for a remote reference.
pub trait WorkflowFetcher: Send + Sync {
    fn fetch(
        &self,
        reference: &RemoteRef,
    ) -> impl Future<Output = CoreResult<FetchedWorkflow>> + Send;
}

/// Object-safe version of [`WorkflowFetcher`] with boxed futures.
pub trait WorkflowFetcherDyn: Send + Sync {
    fn fetch_boxed<'a>(
        &'a self,
        reference: &'a RemoteRef,
    ) -> Pin<Box<dyn Future<Output = CoreResult<FetchedWorkflow>> + Send + 'a>>;
}

impl<T: WorkflowFetcher> WorkflowFetcherDyn for T {
    fn fetch_boxed<'a>(
        &'a self,
        reference: &'a RemoteRef,
    ) -> Pin<Box<dyn Future<Output = CoreResult<FetchedWorkflow>> + Send + 'a>> {
        Box::pin(self.fetch(reference))
    }
}

/// Type-erased workflow fetcher.
pub struct BoxWorkflowFetcher {
    inner: Box<dyn WorkflowFetcherDyn>,
}

impl BoxWorkflowFetcher {
    pub fn new<T: WorkflowFetcher + 'static>(fetcher: T) -> Self {
        Self {
            inner: Box::new(fetcher),
        }
    }

    pub async fn fetch(&self, reference: &RemoteRef) -> CoreResult<FetchedWorkflow> {
        self.inner.fetch_boxed(reference).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_reference() {
        let r = RemoteRef::parse("github.com:acme/flows/deploy/prod.yaml@v2").unwrap();
        assert_eq!(r.host, "github.com");
        assert_eq!(r.owner, "acme");
        assert_eq!(r.repo, "flows");
        assert_eq!(r.path.as_deref(), Some("deploy/prod.yaml"));
        assert_eq!(r.git_ref.as_deref(), Some("v2"));
    }

    #[test]
    fn test_parse_minimal_reference() {
        let r = RemoteRef::parse("gitlab.com:acme/flows").unwrap();
        assert_eq!(r.host, "gitlab.com");
        assert!(r.path.is_none());
        assert!(r.git_ref.is_none());
    }

    #[test]
    fn test_parse_rejects_missing_repo() {
        assert!(RemoteRef::parse("github.com:acme").is_err());
        assert!(RemoteRef::parse("github.com:").is_err());
        assert!(RemoteRef::parse("plain/path.yaml").is_err());
        assert!(RemoteRef::parse("github.com:acme/flows@").is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for s in [
            "github.com:acme/flows",
            "github.com:acme/flows/wf.yaml",
            "github.com:acme/flows/wf.yaml@main",
        ] {
            assert_eq!(RemoteRef::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_looks_remote() {
        assert!(RemoteRef::looks_remote("github.com:acme/flows"));
        assert!(!RemoteRef::looks_remote("workflows/deploy.yaml"));
    }
}
