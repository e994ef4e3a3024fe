//! Repository-host client seam
//!
//! The daemon needs two facts from the code host: the tip of a
//! repository's default branch (for `visible_at_tip` maintenance) and the
//! parents of a commit it has not seen before. Production wiring lives
//! outside this crate; tests and the default configuration use
//! [`StaticRepoHost`].

use crate::error::Result;
use crate::xrepo::CrossRepoIndex;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Merge a newly observed commit into the graph, asking the host for its
/// parents. No-op when the commit is already known.
pub async fn discover_and_update_commit(
    xrepo: &CrossRepoIndex,
    host: &dyn RepoHost,
    repository: &str,
    commit: &str,
) -> Result<()> {
    if xrepo.known_commit(repository, commit).await? {
        return Ok(());
    }
    let parents = host.commit_parents(repository, commit).await?;
    let edges: Vec<(String, Option<String>)> = if parents.is_empty() {
        vec![(commit.to_string(), None)]
    } else {
        parents
            .into_iter()
            .map(|parent| (commit.to_string(), Some(parent)))
            .collect()
    };
    xrepo.update_commits(repository, &edges).await
}

#[async_trait]
pub trait RepoHost: Send + Sync {
    /// Tip commit of the repository's default branch, if known.
    async fn default_branch_tip(&self, repository: &str) -> Result<Option<String>>;

    /// Parent commits of `commit`, empty when unknown or a root commit.
    async fn commit_parents(&self, repository: &str, commit: &str) -> Result<Vec<String>>;
}

/// An in-memory host: serves exactly what it was told and nothing else.
#[derive(Debug, Default)]
pub struct StaticRepoHost {
    tips: RwLock<HashMap<String, String>>,
    parents: RwLock<HashMap<(String, String), Vec<String>>>,
}

impl StaticRepoHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_tip(&self, repository: &str, tip: &str) {
        self.tips
            .write()
            .await
            .insert(repository.to_string(), tip.to_string());
    }

    pub async fn set_parents(&self, repository: &str, commit: &str, parents: Vec<String>) {
        self.parents
            .write()
            .await
            .insert((repository.to_string(), commit.to_string()), parents);
    }
}

#[async_trait]
impl RepoHost for StaticRepoHost {
    async fn default_branch_tip(&self, repository: &str) -> Result<Option<String>> {
        Ok(self.tips.read().await.get(repository).cloned())
    }

    async fn commit_parents(&self, repository: &str, commit: &str) -> Result<Vec<String>> {
        Ok(self
            .parents
            .read()
            .await
            .get(&(repository.to_string(), commit.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
