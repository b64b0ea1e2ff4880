use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Errors raised by workspace collaborators.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace root unavailable: {path}: {source}")]
    RootUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to delete {path}: {source}")]
    Delete {
        path: String,
        source: std::io::Error,
    },
    #[error("snapshot task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// Full-content capture of the workspace at one instant, keyed by
/// workspace-relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    files: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.files.insert(path.into(), content.into());
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    /// Paths in sorted order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl<P: Into<String>, C: Into<String>> FromIterator<(P, C)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (P, C)>>(iter: I) -> Self {
        let mut snapshot = Snapshot::new();
        for (path, content) in iter {
            snapshot.insert(path, content);
        }
        snapshot
    }
}

/// The workspace the agent writes into.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Read every non-hidden file. Files that cannot be read are skipped.
    async fn snapshot(&self) -> Result<Snapshot>;

    /// Replace a file's content, creating parent directories as needed.
    async fn write(&self, path: &str, content: &str) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Let whoever mirrors the workspace pick up the latest contents.
    async fn refresh(&self, _snapshot: &Snapshot) -> Result<()> {
        Ok(())
    }
}

/// Whether a workspace-relative path is excluded from snapshots.
///
/// Dot-prefixed components are always hidden; `ignore` lists additional
/// path prefixes, matched on whole components.
pub fn is_hidden(path: &str, ignore: &[String]) -> bool {
    let normalized = path.replace('\\', "/");
    let mut clean = normalized.as_str();
    while let Some(rest) = clean.strip_prefix("./") {
        clean = rest;
    }
    let clean = clean.trim_start_matches('/');
    if clean.split('/').any(|component| component.starts_with('.')) {
        return true;
    }
    ignore.iter().any(|prefix| {
        let prefix = prefix.trim_matches('/');
        !prefix.is_empty()
            && (clean == prefix
                || clean
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('/')))
    })
}

/// Workspace backed by a directory on disk.
#[derive(Debug, Clone)]
pub struct FsWorkspace {
    root: PathBuf,
    ignore: Vec<String>,
}

impl FsWorkspace {
    pub fn new(root: impl Into<PathBuf>, ignore: Vec<String>) -> Self {
        Self {
            root: root.into(),
            ignore,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn capture(root: &Path, ignore: &[String]) -> Result<Snapshot> {
        std::fs::metadata(root).map_err(|source| WorkspaceError::RootUnavailable {
            path: root.to_path_buf(),
            source,
        })?;

        let mut snapshot = Snapshot::new();
        let walker = WalkDir::new(root).follow_links(false).into_iter();
        for entry in walker.filter_entry(|e| {
            e.path()
                .strip_prefix(root)
                .map(|rel| rel.as_os_str().is_empty() || !is_hidden(&rel.to_string_lossy(), ignore))
                .unwrap_or(false)
        }) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable workspace entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(root) else {
                continue;
            };
            let rel = rel.to_string_lossy().replace('\\', "/");
            match std::fs::read_to_string(entry.path()) {
                Ok(content) => snapshot.insert(rel, content),
                Err(err) => warn!(path = %rel, error = %err, "skipping file in snapshot"),
            }
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl Workspace for FsWorkspace {
    async fn snapshot(&self) -> Result<Snapshot> {
        let root = self.root.clone();
        let ignore = self.ignore.clone();
        let snapshot = tokio::task::spawn_blocking(move || Self::capture(&root, &ignore))
            .await
            .map_err(|err| WorkspaceError::Task(err.to_string()))??;
        debug!(files = snapshot.len(), root = %self.root.display(), "captured workspace snapshot");
        Ok(snapshot)
    }

    async fn write(&self, path: &str, content: &str) -> Result<()> {
        let target = self.root.join(path);
        let to_err = |source| WorkspaceError::Write {
            path: path.to_string(),
            source,
        };
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(to_err)?;
        }
        tokio::fs::write(&target, content).await.map_err(to_err)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match tokio::fs::remove_file(self.root.join(path)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(WorkspaceError::Delete {
                path: path.to_string(),
                source,
            }),
        }
    }
}

/// Workspace held in memory. Useful for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryWorkspace {
    files: Mutex<BTreeMap<String, String>>,
    read_only: Mutex<Vec<String>>,
}

impl MemoryWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files<P: Into<String>, C: Into<String>>(files: impl IntoIterator<Item = (P, C)>) -> Self {
        let workspace = Self::new();
        for (path, content) in files {
            workspace.set(path, content);
        }
        workspace
    }

    /// Write a file directly, the way an agent would.
    pub fn set(&self, path: impl Into<String>, content: impl Into<String>) {
        self.lock_files().insert(path.into(), content.into());
    }

    pub fn remove(&self, path: &str) {
        self.lock_files().remove(path);
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.lock_files().get(path).cloned()
    }

    /// Make `write`/`delete` on `path` fail.
    pub fn make_read_only(&self, path: impl Into<String>) {
        self.read_only
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path.into());
    }

    fn lock_files(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self, path: &str) -> std::result::Result<(), std::io::Error> {
        let read_only = self.read_only.lock().unwrap_or_else(PoisonError::into_inner);
        if read_only.iter().any(|p| p == path) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only file",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Workspace for MemoryWorkspace {
    async fn snapshot(&self) -> Result<Snapshot> {
        Ok(self
            .lock_files()
            .iter()
            .filter(|(path, _)| !is_hidden(path, &[]))
            .map(|(path, content)| (path.clone(), content.clone()))
            .collect())
    }

    async fn write(&self, path: &str, content: &str) -> Result<()> {
        self.check_writable(path)
            .map_err(|source| WorkspaceError::Write {
                path: path.to_string(),
                source,
            })?;
        self.set(path, content);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_writable(path)
            .map_err(|source| WorkspaceError::Delete {
                path: path.to_string(),
                source,
            })?;
        self.remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn hidden_paths() {
        let ignore = vec!["aichat".to_string(), "target".to_string()];
        assert!(is_hidden(".git/config", &ignore));
        assert!(is_hidden("src/.cache/x", &ignore));
        assert!(is_hidden("aichat", &ignore));
        assert!(is_hidden("aichat/log.txt", &ignore));
        assert!(is_hidden("./target/debug/app", &ignore));
        assert!(!is_hidden("aichatter.txt", &ignore));
        assert!(!is_hidden("src/main.rs", &ignore));
    }

    #[tokio::test]
    async fn fs_snapshot_reads_visible_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "pub fn a() {}\n").unwrap();
        fs::write(dir.path().join("README.md"), "hello").unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        fs::write(dir.path().join("blob.bin"), [0xff, 0xfe, 0x00]).unwrap();

        let workspace = FsWorkspace::new(dir.path(), Vec::new());
        let snapshot = workspace.snapshot().await.unwrap();

        let paths: Vec<&str> = snapshot.paths().collect();
        assert_eq!(paths, vec!["README.md", "src/lib.rs"]);
        assert_eq!(snapshot.get("src/lib.rs"), Some("pub fn a() {}\n"));
    }

    #[tokio::test]
    async fn fs_snapshot_missing_root_fails() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = FsWorkspace::new(dir.path().join("nope"), Vec::new());
        assert!(matches!(
            workspace.snapshot().await,
            Err(WorkspaceError::RootUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn fs_write_creates_parents_and_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = FsWorkspace::new(dir.path(), Vec::new());

        workspace.write("a/b/c.txt", "content").await.unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("a/b/c.txt")).unwrap(),
            "content"
        );

        workspace.delete("a/b/c.txt").await.unwrap();
        assert!(!dir.path().join("a/b/c.txt").exists());
        workspace.delete("a/b/c.txt").await.unwrap();
    }

    #[tokio::test]
    async fn memory_workspace_read_only_write_fails() {
        let workspace = MemoryWorkspace::with_files([("a.txt", "x")]);
        workspace.make_read_only("a.txt");
        assert!(matches!(
            workspace.write("a.txt", "y").await,
            Err(WorkspaceError::Write { .. })
        ));
        assert_eq!(workspace.get("a.txt").as_deref(), Some("x"));
    }
}
