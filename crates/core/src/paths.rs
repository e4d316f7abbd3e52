//! Artifact storage layout and cross-environment path rewriting.
//!
//! Intake may run inside a container that sees storage at e.g.
//! `/app/storage`, while the worker process runs on the host where the
//! same directory lives somewhere else. [`PathRewrite`] maps one root
//! onto the other with a plain prefix substitution.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::types::RequestId;

/// Injected `(path) -> path` mapping applied before the worker is launched.
pub type PathMapper = Arc<dyn Fn(&str) -> PathBuf + Send + Sync>;

/// A mapper that returns its input unchanged.
pub fn identity_mapper() -> PathMapper {
    Arc::new(|path: &str| PathBuf::from(path))
}

/// Prefix substitution from a container storage root to a host root.
#[derive(Debug, Clone)]
pub struct PathRewrite {
    /// Root as seen by intake, normalised to forward slashes without a
    /// trailing slash. `None` disables rewriting.
    container_prefix: Option<String>,
    host_root: PathBuf,
}

impl PathRewrite {
    pub fn new(container_prefix: Option<&str>, host_root: impl Into<PathBuf>) -> Self {
        let container_prefix = container_prefix
            .map(|p| normalise(p).trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty());
        Self {
            container_prefix,
            host_root: host_root.into(),
        }
    }

    /// A rewrite that never changes anything.
    pub fn disabled() -> Self {
        Self {
            container_prefix: None,
            host_root: PathBuf::new(),
        }
    }

    /// Rewrite `path` if it lives under the container prefix.
    ///
    /// Paths outside the prefix (and every path when no prefix is
    /// configured) are returned unchanged.
    pub fn apply(&self, path: &str) -> PathBuf {
        let Some(prefix) = &self.container_prefix else {
            return PathBuf::from(path);
        };

        let normalised = normalise(path);
        let Some(rest) = normalised.strip_prefix(prefix.as_str()) else {
            return PathBuf::from(path);
        };
        // `/app/storage2` must not match the `/app/storage` prefix.
        if !rest.is_empty() && !rest.starts_with('/') {
            return PathBuf::from(path);
        }

        rest.split('/')
            .filter(|segment| !segment.is_empty())
            .fold(self.host_root.clone(), |acc, segment| acc.join(segment))
    }

    pub fn into_mapper(self) -> PathMapper {
        Arc::new(move |path: &str| self.apply(path))
    }
}

fn normalise(path: &str) -> String {
    path.replace('\\', "/")
}

/// Top-level storage areas under the storage root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageArea {
    Uploads,
    Originals,
    Translated,
}

impl StorageArea {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploads => "uploads",
            Self::Originals => "originals",
            Self::Translated => "translated",
        }
    }
}

impl fmt::Display for StorageArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directory convention `{root}/{uploads|originals|translated}/{requestId}/...`.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-request directory inside `area`.
    pub fn request_dir(&self, area: StorageArea, request_id: RequestId) -> PathBuf {
        self.root.join(area.as_str()).join(request_id.to_string())
    }

    /// Parent of the per-job scratch directories handed to the worker.
    pub fn scratch_root(&self) -> PathBuf {
        self.root.join("temp")
    }

    /// Public reference for a stored artifact, e.g.
    /// `/api/files/{id}/translated/chapter/001.png`.
    ///
    /// `relative` is relative to the request's directory in `area`.
    pub fn artifact_ref(&self, request_id: RequestId, area: StorageArea, relative: &Path) -> String {
        let rel = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        format!("/api/files/{request_id}/{area}/{rel}")
    }
}
