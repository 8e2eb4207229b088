//! Source-control steps for story workers.
//!
//! Local repository work (init, branch, commit) goes through `git2`; steps
//! that talk to a remote or need porcelain (clone, push, merge) shell out to
//! `git`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use git2::{BranchType, IndexAddOption, Repository, Signature};
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub hash: String,
    pub files: Vec<String>,
}

#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Make `workspace` a checkout of `repository` (or a fresh repository
    /// when there is none) with `branch` checked out.
    async fn prepare_workspace(
        &self,
        workspace: &Path,
        repository: Option<&str>,
        branch: &str,
    ) -> Result<()>;

    /// Commit every change in the workspace. `None` when nothing changed.
    async fn commit_all(&self, workspace: &Path, message: &str) -> Result<Option<CommitInfo>>;

    /// Push `branch` to `origin`. Returns false when there is no remote.
    async fn push(&self, workspace: &Path, branch: &str) -> Result<bool>;

    /// Merge `from` into `into` and leave `into` checked out.
    async fn merge(&self, workspace: &Path, from: &str, into: &str) -> Result<()>;
}

const AUTHOR_NAME: &str = "anvil";
const AUTHOR_EMAIL: &str = "anvil@localhost";

#[derive(Debug, Clone)]
pub struct GitCli {
    git_cmd: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            git_cmd: "git".to_string(),
        }
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.git_cmd)
            .arg("-c")
            .arg(format!("user.name={AUTHOR_NAME}"))
            .arg("-c")
            .arg(format!("user.email={AUTHOR_EMAIL}"))
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))?;

        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn has_remote_branch(&self, dir: &Path, branch: &str) -> bool {
        if self.git(dir, &["fetch", "origin", branch]).await.is_err() {
            return false;
        }
        self.git(dir, &["rev-parse", "--verify", &format!("origin/{branch}")])
            .await
            .is_ok()
    }
}

fn has_origin(workspace: &Path) -> bool {
    Repository::open(workspace)
        .map(|repo| repo.find_remote("origin").is_ok())
        .unwrap_or(false)
}

/// Point HEAD at `branch`, creating it from the current commit if needed.
/// Works on unborn repositories too.
fn checkout_branch(workspace: &Path, branch: &str) -> Result<()> {
    let repo = Repository::open(workspace).context("Failed to open git repository")?;
    let refname = format!("refs/heads/{branch}");

    let head_commit = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    if repo.find_branch(branch, BranchType::Local).is_err()
        && let Some(commit) = &head_commit
    {
        repo.branch(branch, commit, false)
            .with_context(|| format!("Failed to create branch {branch}"))?;
    }

    repo.set_head(&refname)
        .with_context(|| format!("Failed to switch to {branch}"))?;
    if head_commit.is_some() {
        repo.checkout_head(Some(git2::build::CheckoutBuilder::new().safe()))
            .with_context(|| format!("Failed to check out {branch}"))?;
    }
    Ok(())
}

fn commit_workspace(workspace: &Path, message: &str) -> Result<Option<CommitInfo>> {
    let repo = Repository::open(workspace).context("Failed to open git repository")?;
    let mut index = repo.index()?;
    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
    index.update_all(["*"].iter(), None)?;
    index.write()?;

    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());

    let parent_tree = parent.as_ref().map(|p| p.tree()).transpose()?;
    if parent_tree.as_ref().map(|t| t.id()) == Some(tree_id) {
        return Ok(None);
    }

    let diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)?;
    let files: Vec<String> = diff
        .deltas()
        .filter_map(|d| d.new_file().path().or_else(|| d.old_file().path()))
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .collect();
    if files.is_empty() {
        return Ok(None);
    }

    let sig = Signature::now(AUTHOR_NAME, AUTHOR_EMAIL)?;
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    Ok(Some(CommitInfo {
        hash: oid.to_string(),
        files,
    }))
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("Git task panicked")?
}

#[async_trait]
impl SourceControl for GitCli {
    async fn prepare_workspace(
        &self,
        workspace: &Path,
        repository: Option<&str>,
        branch: &str,
    ) -> Result<()> {
        tokio::fs::create_dir_all(workspace)
            .await
            .with_context(|| format!("Failed to create {}", workspace.display()))?;

        if !workspace.join(".git").exists() {
            let empty = std::fs::read_dir(workspace)
                .map(|mut d| d.next().is_none())
                .unwrap_or(false);
            match repository {
                Some(repo) if empty && is_cloneable(repo) => {
                    info!(repository = %repo, workspace = %workspace.display(), "Cloning repository");
                    let parent = workspace.parent().unwrap_or(workspace);
                    let target = workspace.display().to_string();
                    self.git(parent, &["clone", repo, &target]).await?;
                }
                _ => {
                    let path = workspace.to_path_buf();
                    blocking(move || {
                        Repository::init(&path).context("Failed to init repository")?;
                        Ok(())
                    })
                    .await?;
                }
            }
        }

        let path = workspace.to_path_buf();
        let branch = branch.to_string();
        blocking(move || checkout_branch(&path, &branch)).await
    }

    async fn commit_all(&self, workspace: &Path, message: &str) -> Result<Option<CommitInfo>> {
        let path = workspace.to_path_buf();
        let message = message.to_string();
        let commit = blocking(move || commit_workspace(&path, &message)).await?;
        if let Some(c) = &commit {
            debug!(workspace = %workspace.display(), hash = %c.hash, files = c.files.len(), "Committed");
        }
        Ok(commit)
    }

    async fn push(&self, workspace: &Path, branch: &str) -> Result<bool> {
        if !has_origin(workspace) {
            debug!(workspace = %workspace.display(), "No origin remote; skipping push");
            return Ok(false);
        }
        self.git(workspace, &["push", "-u", "origin", branch]).await?;
        Ok(true)
    }

    async fn merge(&self, workspace: &Path, from: &str, into: &str) -> Result<()> {
        if has_origin(workspace) && self.has_remote_branch(workspace, into).await {
            self.git(workspace, &["checkout", "-B", into, &format!("origin/{into}")])
                .await?;
            self.git(workspace, &["merge", "--no-ff", "--no-edit", from])
                .await?;
        } else {
            // No upstream epic branch yet: it starts at the story's tip.
            self.git(workspace, &["checkout", "-B", into, from]).await?;
        }
        Ok(())
    }
}

fn is_cloneable(repository: &str) -> bool {
    repository.contains("://")
        || repository.starts_with("git@")
        || PathBuf::from(repository).join(".git").exists()
}
