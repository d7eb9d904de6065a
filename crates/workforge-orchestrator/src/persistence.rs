use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use workforge_core::{WorkforgeError, WorkforgeResult};

/// Identifier of a persisted write, opaque to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(pub String);

impl std::fmt::Display for CommitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Materializes accepted artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write `content` at `file_path`, returning an identifier for the write.
    async fn write(&self, file_path: &str, content: &str) -> WorkforgeResult<CommitId>;
}

/// Reject absolute paths and `..` components.
pub fn validate_relative_path(file_path: &str) -> WorkforgeResult<()> {
    let path = std::path::Path::new(file_path);
    let escapes = path.components().any(|c| {
        matches!(
            c,
            std::path::Component::ParentDir
                | std::path::Component::RootDir
                | std::path::Component::Prefix(_)
        )
    });
    if file_path.trim().is_empty() || escapes {
        return Err(WorkforgeError::Persistence(format!(
            "Refusing to write outside the project: {file_path}"
        )));
    }
    Ok(())
}

/// In-memory store for tests and dry runs.
pub struct InMemoryArtifactStore {
    files: RwLock<BTreeMap<String, String>>,
    writes: AtomicU64,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(BTreeMap::new()),
            writes: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, file_path: &str) -> Option<String> {
        self.files.read().await.get(file_path).cloned()
    }

    pub async fn paths(&self) -> Vec<String> {
        self.files.read().await.keys().cloned().collect()
    }

    /// Number of writes, overwrites included.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn write(&self, file_path: &str, content: &str) -> WorkforgeResult<CommitId> {
        validate_relative_path(file_path)?;
        self.files
            .write()
            .await
            .insert(file_path.to_string(), content.to_string());
        let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CommitId(format!("mem-{n}")))
    }
}
