//! Per-run workspace allocation and addressing.
//!
//! Each run owns one directory under the configured runs root, with a
//! `raw/` staging area and a `curated/` output area. A workspace is never
//! shared between run identifiers; creation fails on collision rather than
//! silently reusing a directory. The runs root is passed in at construction
//! rather than read from ambient configuration.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::domain::RunId;

/// Staging area subdirectory
pub const RAW_DIR: &str = "raw";

/// Curated output subdirectory
pub const CURATED_DIR: &str = "curated";

/// Durable terminal record file name
const STATUS_FILE: &str = "status.json";

/// Streaming-phase child pid marker file name
const PID_FILE: &str = "child.pid";

/// Errors from workspace allocation and lookup
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to allocate workspace at {path}: {source}")]
    Allocation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no workspace for run {0}")]
    NotFound(RunId),

    #[error("invalid artifact name `{0}`")]
    InvalidArtifactName(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// The on-disk directory tree owned exclusively by one run
#[derive(Debug, Clone)]
pub struct Workspace {
    run_id: RunId,
    root: PathBuf,
}

impl Workspace {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join(RAW_DIR)
    }

    pub fn curated_dir(&self) -> PathBuf {
        self.root.join(CURATED_DIR)
    }

    pub fn status_path(&self) -> PathBuf {
        self.root.join(STATUS_FILE)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.root.join(PID_FILE)
    }

    /// Path of a named file under the curated area.
    ///
    /// The name must be a bare file name; anything that could traverse out
    /// of the curated directory is rejected.
    pub fn curated_artifact(&self, name: &str) -> Result<PathBuf, WorkspaceError> {
        let mut components = Path::new(name).components();
        let valid = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );

        if !valid {
            return Err(WorkspaceError::InvalidArtifactName(name.to_string()));
        }

        Ok(self.curated_dir().join(name))
    }
}

/// Allocates and resolves per-run workspaces under a fixed runs root.
///
/// Pure filesystem bookkeeping; no process or run-state concerns.
pub struct WorkspaceManager {
    runs_root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(runs_root: PathBuf) -> Self {
        Self { runs_root }
    }

    pub fn runs_root(&self) -> &Path {
        &self.runs_root
    }

    /// Allocate a fresh workspace with a newly generated run id.
    ///
    /// Atomic in effect: if any subdirectory cannot be created, the
    /// partially created tree is removed before the error is returned.
    pub async fn create(&self) -> Result<Workspace, WorkspaceError> {
        let run_id = RunId::generate();
        let root = self.runs_root.join(run_id.as_str());

        fs::create_dir_all(&self.runs_root)
            .await
            .map_err(|source| WorkspaceError::Allocation {
                path: self.runs_root.clone(),
                source,
            })?;

        // create_dir (not create_dir_all) so an id collision fails loudly
        // instead of silently reusing another run's directory
        fs::create_dir(&root)
            .await
            .map_err(|source| WorkspaceError::Allocation {
                path: root.clone(),
                source,
            })?;

        for sub in [RAW_DIR, CURATED_DIR] {
            let dir = root.join(sub);
            if let Err(source) = fs::create_dir(&dir).await {
                let _ = fs::remove_dir_all(&root).await;
                return Err(WorkspaceError::Allocation { path: dir, source });
            }
        }

        debug!(%run_id, path = %root.display(), "workspace allocated");

        Ok(Workspace { run_id, root })
    }

    /// Resolve the workspace of an existing run id
    pub async fn resolve(&self, run_id: &RunId) -> Result<Workspace, WorkspaceError> {
        let root = self.runs_root.join(run_id.as_str());

        match fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => Ok(Workspace {
                run_id: run_id.clone(),
                root,
            }),
            _ => Err(WorkspaceError::NotFound(run_id.clone())),
        }
    }

    /// Run ids with a workspace on disk, in no particular order
    pub async fn list(&self) -> Result<Vec<RunId>, WorkspaceError> {
        let mut ids = Vec::new();

        let mut entries = match fs::read_dir(&self.runs_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(RunId::from(name));
                }
            }
        }

        Ok(ids)
    }
}
