use std::path::{Component, Path, PathBuf};

use http::{Method, StatusCode};

/// Outcome of mapping a request target onto the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Serve this file through the normal pipeline.
    Asset(PathBuf),
    /// Answer immediately with this status and a standard error body.
    Status(StatusCode),
    /// The resolver answered the request itself; the dispatcher stands down.
    Deferred,
}

/// Maps a method and request target to a filesystem path or a terminal
/// status. Implementations decide routing policy; the dispatcher only
/// serves what they hand back.
pub trait PathResolver: Send + Sync {
    fn resolve(&self, method: &Method, target: &str) -> Resolution;
}

/// Default resolver: serves files under a single root directory, with a
/// configurable index file for `/` and directory targets.
pub struct DirectoryResolver {
    root: PathBuf,
    index_file: String,
}

impl DirectoryResolver {
    pub fn new(root: PathBuf, index_file: String) -> Self {
        Self { root, index_file }
    }
}

impl PathResolver for DirectoryResolver {
    fn resolve(&self, _method: &Method, target: &str) -> Resolution {
        // Query strings never reach the filesystem.
        let path_part = target.split(['?', '#']).next().unwrap_or(target);
        if !path_part.starts_with('/') {
            return Resolution::Status(StatusCode::NOT_FOUND);
        }

        let mut relative = path_part.trim_start_matches('/').to_string();
        if relative.is_empty() || relative.ends_with('/') {
            relative.push_str(&self.index_file);
        }

        let candidate = Path::new(&relative);
        // Reject any component that could escape the root.
        let traversal = candidate.components().any(|component| {
            !matches!(component, Component::Normal(_) | Component::CurDir)
        });
        if traversal {
            return Resolution::Status(StatusCode::NOT_FOUND);
        }

        Resolution::Asset(self.root.join(candidate))
    }
}
