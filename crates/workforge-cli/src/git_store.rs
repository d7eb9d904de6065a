//! Artifact store that commits every accepted file to a git repository.

use crate::app_config::CommitAuthor;
use async_trait::async_trait;
use git2::{Commit, Repository, Signature};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use workforge_core::{WorkforgeError, WorkforgeResult};
use workforge_orchestrator::persistence::validate_relative_path;
use workforge_orchestrator::{ArtifactStore, CommitId};

fn git_err(e: git2::Error) -> WorkforgeError {
    WorkforgeError::Persistence(format!("git: {}", e.message()))
}

/// Writes files under the repository's work tree and commits each one on
/// `HEAD`. Paths must stay inside the work tree.
pub struct GitArtifactStore {
    root: PathBuf,
    repo: Arc<Mutex<Repository>>,
    author: CommitAuthor,
}

impl GitArtifactStore {
    /// Open the repository at `root`, initialising it if needed.
    pub fn open_or_init(root: &Path, author: CommitAuthor) -> WorkforgeResult<Self> {
        std::fs::create_dir_all(root)?;
        let repo = match Repository::open(root) {
            Ok(repo) => repo,
            Err(_) => {
                info!(path = %root.display(), "Initialising artifact repository");
                Repository::init(root).map_err(git_err)?
            }
        };
        let root = repo
            .workdir()
            .ok_or_else(|| WorkforgeError::Persistence("artifact repository is bare".into()))?
            .canonicalize()?;
        Ok(Self {
            root,
            repo: Arc::new(Mutex::new(repo)),
            author,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ArtifactStore for GitArtifactStore {
    async fn write(&self, file_path: &str, content: &str) -> WorkforgeResult<CommitId> {
        validate_relative_path(file_path)?;
        let repo = Arc::clone(&self.repo);
        let root = self.root.clone();
        let author = self.author.clone();
        let rel = file_path.to_string();
        let content = content.to_string();

        let commit = tokio::task::spawn_blocking(move || {
            commit_file(&repo.lock(), &root, &rel, &content, &author)
        })
        .await
        .map_err(|e| WorkforgeError::Persistence(format!("git task failed: {e}")))??;

        info!(path = %file_path, commit = %commit, "Artifact committed");
        Ok(commit)
    }
}

fn commit_file(
    repo: &Repository,
    root: &Path,
    rel: &str,
    content: &str,
    author: &CommitAuthor,
) -> WorkforgeResult<CommitId> {
    let full = root.join(rel);
    ensure_inside(root, &full, rel)?;
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&full, content)?;

    let mut index = repo.index().map_err(git_err)?;
    index.add_path(Path::new(rel)).map_err(git_err)?;
    index.write().map_err(git_err)?;
    let tree_id = index.write_tree().map_err(git_err)?;
    let tree = repo.find_tree(tree_id).map_err(git_err)?;

    let signature = Signature::now(&author.name, &author.email).map_err(git_err)?;
    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit().map_err(git_err)?),
        // Unborn branch: first commit.
        Err(_) => None,
    };
    let parents: Vec<&Commit> = parent.iter().collect();
    let oid = repo
        .commit(
            Some("HEAD"),
            &signature,
            &signature,
            &format!("workforge: write {rel}"),
            &tree,
            &parents,
        )
        .map_err(git_err)?;
    Ok(CommitId(oid.to_string()))
}

/// Refuse a target that leaves `root` through a symlink, before any
/// directory is created for it.
fn ensure_inside(root: &Path, full: &Path, rel: &str) -> WorkforgeResult<()> {
    let outside = || WorkforgeError::Persistence(format!("{rel} resolves outside the repository"));
    if std::fs::symlink_metadata(full).is_ok_and(|m| m.file_type().is_symlink()) {
        return Err(outside());
    }
    let mut ancestor = full.parent();
    while let Some(dir) = ancestor {
        if std::fs::symlink_metadata(dir).is_ok() {
            let resolved = dir.canonicalize().map_err(|_| outside())?;
            if !resolved.starts_with(root) {
                return Err(outside());
            }
            return Ok(());
        }
        ancestor = dir.parent();
    }
    Err(outside())
}
