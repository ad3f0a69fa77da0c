//! Workspace lifecycle: per-(job, agent) filesystem sandboxes.
//!
//! Each agent gets a private materialized copy of the source tree under
//! `<root>/<job_id>/<agent_key>/`. Workspaces are never shared between
//! agents and never reused across jobs; teardown removes the whole job
//! directory and is idempotent.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::{AgentKey, PRIMARY_KEYS};
use crate::{Result, TriadError};

/// Where a job's source tree comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    /// Remote repository, cloned shallow and single-branch.
    Remote {
        url: String,
        reference: Option<String>,
    },
    /// Local directory, copied file by file.
    Local { path: PathBuf },
}

impl SourceSpec {
    /// Classify a raw source string from a start request.
    pub fn parse(raw: &str) -> Self {
        let looks_remote = raw.starts_with("http://")
            || raw.starts_with("https://")
            || raw.starts_with("git@")
            || raw.starts_with("ssh://")
            || raw.starts_with("file://");
        if looks_remote {
            SourceSpec::Remote {
                url: raw.to_string(),
                reference: None,
            }
        } else {
            SourceSpec::Local {
                path: PathBuf::from(raw),
            }
        }
    }

    pub fn with_reference(self, reference: Option<String>) -> Self {
        match self {
            SourceSpec::Remote { url, .. } => SourceSpec::Remote { url, reference },
            local => local,
        }
    }
}

/// Service for allocating and releasing agent workspaces.
pub struct WorkspaceManager {
    root: PathBuf,
    size_limit_bytes: Option<u64>,
}

impl WorkspaceManager {
    pub fn new(root: PathBuf, size_limit_bytes: Option<u64>) -> Self {
        Self {
            root,
            size_limit_bytes,
        }
    }

    /// Directory owned by one job.
    pub fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    /// Directory owned by one agent of one job.
    pub fn agent_dir(&self, job_id: Uuid, key: AgentKey) -> PathBuf {
        self.job_dir(job_id).join(key.as_str())
    }

    /// Materialize a fresh workspace for `(job_id, key)`.
    ///
    /// Fails closed if the target directory already exists non-empty, and
    /// enforces the size quota; both are non-retryable.
    pub async fn allocate(
        &self,
        job_id: Uuid,
        key: AgentKey,
        source: &SourceSpec,
    ) -> Result<PathBuf> {
        let dest = self.agent_dir(job_id, key);

        if dest.exists() && !is_empty_dir(&dest).await? {
            return Err(TriadError::Workspace(format!(
                "target {} already exists and is not empty",
                dest.display()
            )));
        }

        tokio::fs::create_dir_all(&dest)
            .await
            .map_err(|e| TriadError::Workspace(format!("failed to create workspace: {e}")))?;

        info!(%job_id, agent_key = %key, path = %dest.display(), "allocating workspace");

        match source {
            SourceSpec::Local { path } => {
                if !path.is_dir() {
                    self.release(&dest).await?;
                    return Err(TriadError::Workspace(format!(
                        "source directory {} does not exist",
                        path.display()
                    )));
                }
                if let Some(limit) = self.size_limit_bytes {
                    let size = dir_size(path).await?;
                    if size > limit {
                        self.release(&dest).await?;
                        return Err(TriadError::Workspace(format!(
                            "source size {size} bytes exceeds quota of {limit} bytes"
                        )));
                    }
                }
                copy_tree(path, &dest).await?;
            }
            SourceSpec::Remote { url, reference } => {
                if let Err(e) = git_clone(url, reference.as_deref(), &dest).await {
                    let _ = self.release(&dest).await;
                    return Err(e);
                }
                if let Some(limit) = self.size_limit_bytes {
                    let size = dir_size(&dest).await?;
                    if size > limit {
                        self.release(&dest).await?;
                        return Err(TriadError::Workspace(format!(
                            "cloned size {size} bytes exceeds quota of {limit} bytes"
                        )));
                    }
                }
            }
        }

        Ok(dest)
    }

    /// Remove one workspace directory. Removing a directory that is already
    /// gone is a no-op.
    pub async fn release(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                debug!(path = %path.display(), "workspace released");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TriadError::Workspace(format!(
                "failed to remove {}: {e}",
                path.display()
            ))),
        }
    }

    /// Remove every workspace owned by a job. Idempotent.
    pub async fn release_job(&self, job_id: Uuid) -> Result<()> {
        info!(%job_id, "releasing all job workspaces");
        self.release(&self.job_dir(job_id)).await
    }

    /// Expose the primary workspaces inside the integrator workspace as
    /// relative symlinks `./primary-1` .. `./primary-3`.
    ///
    /// Primaries whose workspace never materialized (quota failures) are
    /// skipped; the integrator sees those paths as absent.
    pub async fn stage_integration(&self, job_id: Uuid) -> Result<()> {
        let integrator_dir = self.agent_dir(job_id, AgentKey::Integrator);
        for key in PRIMARY_KEYS {
            let primary = self.agent_dir(job_id, key);
            if !primary.is_dir() {
                warn!(%job_id, agent_key = %key, "primary workspace absent; not exposed to integrator");
                continue;
            }
            let link = integrator_dir.join(key.as_str());
            if link.exists() {
                continue;
            }
            let target = Path::new("..").join(key.as_str());
            symlink_dir(&target, &link).await.map_err(|e| {
                TriadError::Workspace(format!(
                    "failed to expose {} to integrator: {e}",
                    key.as_str()
                ))
            })?;
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(windows)]
async fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink_dir(target, link).await
}

// ---------------------------------------------------------------------------
// Materialization helpers
// ---------------------------------------------------------------------------

async fn is_empty_dir(path: &Path) -> Result<bool> {
    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(|e| TriadError::Workspace(format!("cannot inspect {}: {e}", path.display())))?;
    Ok(entries
        .next_entry()
        .await
        .map_err(TriadError::Io)?
        .is_none())
}

/// Total size in bytes of all regular files under `path`, not following
/// symlinks.
pub async fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(TriadError::Io)?;
        while let Some(entry) = entries.next_entry().await.map_err(TriadError::Io)? {
            let meta = entry.metadata().await.map_err(TriadError::Io)?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }

    Ok(total)
}

/// Copy a directory tree. Regular files and directories are replicated;
/// symlinks are recreated as links.
async fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    let mut stack = vec![(src.to_path_buf(), dest.to_path_buf())];

    while let Some((from, to)) = stack.pop() {
        tokio::fs::create_dir_all(&to).await.map_err(TriadError::Io)?;
        let mut entries = tokio::fs::read_dir(&from).await.map_err(TriadError::Io)?;
        while let Some(entry) = entries.next_entry().await.map_err(TriadError::Io)? {
            let entry_from = entry.path();
            let entry_to = to.join(entry.file_name());
            let file_type = entry.file_type().await.map_err(TriadError::Io)?;

            if file_type.is_dir() {
                stack.push((entry_from, entry_to));
            } else if file_type.is_symlink() {
                let target = tokio::fs::read_link(&entry_from)
                    .await
                    .map_err(TriadError::Io)?;
                symlink_dir(&target, &entry_to)
                    .await
                    .map_err(TriadError::Io)?;
            } else {
                tokio::fs::copy(&entry_from, &entry_to)
                    .await
                    .map_err(TriadError::Io)?;
            }
        }
    }

    Ok(())
}

/// Shallow, single-branch clone of `url` into `dest`.
async fn git_clone(url: &str, reference: Option<&str>, dest: &Path) -> Result<()> {
    let dest_str = dest
        .to_str()
        .ok_or_else(|| TriadError::Workspace("workspace path is not valid UTF-8".into()))?;

    let mut args: Vec<&str> = vec!["clone", "--depth", "1", "--single-branch"];
    if let Some(reference) = reference {
        args.push("--branch");
        args.push(reference);
    }
    args.push(url);
    args.push(dest_str);

    debug!(?args, "running git command");
    let output = Command::new("git")
        .args(&args)
        .output()
        .await
        .map_err(|e| TriadError::Git(format!("failed to execute git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TriadError::Git(format!("git clone of {url} failed: {stderr}")));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn fixture_source() -> TempDir {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("README.md"), "# fixture\n")
            .await
            .unwrap();
        tokio::fs::create_dir(tmp.path().join("src")).await.unwrap();
        tokio::fs::write(tmp.path().join("src/main.rs"), "fn main() {}\n")
            .await
            .unwrap();
        tmp
    }

    fn local_spec(tmp: &TempDir) -> SourceSpec {
        SourceSpec::Local {
            path: tmp.path().to_path_buf(),
        }
    }

    #[test]
    fn source_spec_classification() {
        assert!(matches!(
            SourceSpec::parse("https://example.com/repo.git"),
            SourceSpec::Remote { .. }
        ));
        assert!(matches!(
            SourceSpec::parse("git@example.com:org/repo.git"),
            SourceSpec::Remote { .. }
        ));
        assert!(matches!(
            SourceSpec::parse("/tmp/fixtures/ok"),
            SourceSpec::Local { .. }
        ));
        assert!(matches!(
            SourceSpec::parse("relative/dir"),
            SourceSpec::Local { .. }
        ));
    }

    #[tokio::test]
    async fn allocate_copies_local_tree() {
        let source = fixture_source().await;
        let root = TempDir::new().unwrap();
        let mgr = WorkspaceManager::new(root.path().to_path_buf(), None);
        let job_id = Uuid::new_v4();

        let ws = mgr
            .allocate(job_id, AgentKey::Primary1, &local_spec(&source))
            .await
            .unwrap();

        assert!(ws.join("README.md").is_file());
        assert!(ws.join("src/main.rs").is_file());
    }

    #[tokio::test]
    async fn workspaces_are_disjoint_per_agent() {
        let source = fixture_source().await;
        let root = TempDir::new().unwrap();
        let mgr = WorkspaceManager::new(root.path().to_path_buf(), None);
        let job_id = Uuid::new_v4();

        let a = mgr
            .allocate(job_id, AgentKey::Primary1, &local_spec(&source))
            .await
            .unwrap();
        let b = mgr
            .allocate(job_id, AgentKey::Primary2, &local_spec(&source))
            .await
            .unwrap();

        assert_ne!(a, b);
        // Mutating one must not affect the other.
        tokio::fs::write(a.join("README.md"), "changed").await.unwrap();
        let other = tokio::fs::read_to_string(b.join("README.md")).await.unwrap();
        assert_eq!(other, "# fixture\n");
    }

    #[tokio::test]
    async fn allocate_fails_closed_on_nonempty_target() {
        let source = fixture_source().await;
        let root = TempDir::new().unwrap();
        let mgr = WorkspaceManager::new(root.path().to_path_buf(), None);
        let job_id = Uuid::new_v4();

        let dest = mgr.agent_dir(job_id, AgentKey::Primary1);
        tokio::fs::create_dir_all(&dest).await.unwrap();
        tokio::fs::write(dest.join("leftover"), "x").await.unwrap();

        let err = mgr
            .allocate(job_id, AgentKey::Primary1, &local_spec(&source))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not empty"));
    }

    #[tokio::test]
    async fn quota_exceeded_is_workspace_error() {
        let source = fixture_source().await;
        let root = TempDir::new().unwrap();
        let mgr = WorkspaceManager::new(root.path().to_path_buf(), Some(4));
        let job_id = Uuid::new_v4();

        let err = mgr
            .allocate(job_id, AgentKey::Primary3, &local_spec(&source))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quota"));
        // Nothing left behind for the failed agent.
        assert!(!mgr.agent_dir(job_id, AgentKey::Primary3).exists());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let source = fixture_source().await;
        let root = TempDir::new().unwrap();
        let mgr = WorkspaceManager::new(root.path().to_path_buf(), None);
        let job_id = Uuid::new_v4();

        let ws = mgr
            .allocate(job_id, AgentKey::Primary1, &local_spec(&source))
            .await
            .unwrap();

        mgr.release(&ws).await.unwrap();
        assert!(!ws.exists());
        // Second release is a no-op.
        mgr.release(&ws).await.unwrap();
        mgr.release_job(job_id).await.unwrap();
        mgr.release_job(job_id).await.unwrap();
    }

    #[tokio::test]
    async fn stage_integration_links_present_primaries() {
        let source = fixture_source().await;
        let root = TempDir::new().unwrap();
        let mgr = WorkspaceManager::new(root.path().to_path_buf(), None);
        let job_id = Uuid::new_v4();

        mgr.allocate(job_id, AgentKey::Primary1, &local_spec(&source))
            .await
            .unwrap();
        mgr.allocate(job_id, AgentKey::Primary2, &local_spec(&source))
            .await
            .unwrap();
        // primary-3 deliberately absent (failed allocation).
        let integ = mgr
            .allocate(job_id, AgentKey::Integrator, &local_spec(&source))
            .await
            .unwrap();

        mgr.stage_integration(job_id).await.unwrap();

        assert!(integ.join("primary-1").join("README.md").is_file());
        assert!(integ.join("primary-2").join("README.md").is_file());
        assert!(!integ.join("primary-3").exists());
    }

    #[tokio::test]
    async fn dir_size_counts_files() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("a"), vec![0u8; 100])
            .await
            .unwrap();
        tokio::fs::create_dir(tmp.path().join("nested")).await.unwrap();
        tokio::fs::write(tmp.path().join("nested/b"), vec![0u8; 50])
            .await
            .unwrap();

        assert_eq!(dir_size(tmp.path()).await.unwrap(), 150);
    }

    #[tokio::test]
    async fn remote_clone_from_local_repo() {
        // A path-based clone exercises the same code path as a URL clone.
        let repo = TempDir::new().unwrap();
        let root = repo.path();
        let git = |args: &[&str]| {
            let root = root.to_path_buf();
            let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
            async move {
                let out = Command::new("git")
                    .args(&args)
                    .current_dir(&root)
                    .output()
                    .await
                    .unwrap();
                assert!(out.status.success(), "git {args:?} failed");
            }
        };
        git(&["init"]).await;
        git(&["config", "user.email", "test@triad.dev"]).await;
        git(&["config", "user.name", "Triad Test"]).await;
        tokio::fs::write(root.join("file.txt"), "hello\n").await.unwrap();
        git(&["add", "."]).await;
        git(&["commit", "-m", "initial"]).await;

        let ws_root = TempDir::new().unwrap();
        let mgr = WorkspaceManager::new(ws_root.path().to_path_buf(), None);
        let job_id = Uuid::new_v4();
        let spec = SourceSpec::Remote {
            url: format!("file://{}", root.display()),
            reference: None,
        };

        let ws = mgr
            .allocate(job_id, AgentKey::Primary1, &spec)
            .await
            .unwrap();
        assert!(ws.join("file.txt").is_file());
    }
}
