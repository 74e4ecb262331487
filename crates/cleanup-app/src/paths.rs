//! Filesystem path helpers (XDG-aware) for the local marker blob store.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("unable to determine project directories")]
    MissingProjectDirs,
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Container providing filesystem paths for the application. In production this is
/// rooted at `$XDG_DATA_HOME/cleanup`; tests may construct custom instances.
#[derive(Debug, Clone)]
pub struct AppPaths {
    base_dir: PathBuf,
}

impl AppPaths {
    /// Construct paths rooted under `$XDG_DATA_HOME/cleanup`.
    pub fn from_project_dirs() -> Result<Self, PathError> {
        let dirs = project_dirs().ok_or(PathError::MissingProjectDirs)?;
        Self::new(dirs.data_dir())
    }

    /// Construct paths rooted under the provided directory, ensuring it exists.
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self, PathError> {
        let base = base.as_ref().to_path_buf();
        ensure_dir(&base)?;
        Ok(Self { base_dir: base })
    }

    /// Base data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.clone()
    }

    /// Root of the blob store (`.../blobs`).
    pub fn blobs_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["blobs"])
    }

    /// Scratch directory for in-flight blob writes (`.../blobs/.tmp`).
    ///
    /// Lives under the blob root so the final rename never crosses devices.
    pub fn blob_tmp_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["blobs", ".tmp"])
    }

    fn ensure_child(&self, segments: &[&str]) -> Result<PathBuf, PathError> {
        let mut path = self.base_dir.clone();
        for segment in segments {
            path.push(segment);
        }
        ensure_dir(&path)
    }
}

pub(crate) fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("ai", "dataloop", "cleanup")
}

pub(crate) fn ensure_dir(path: &Path) -> Result<PathBuf, PathError> {
    if let Err(err) = fs::create_dir_all(path)
        && err.kind() != io::ErrorKind::AlreadyExists
    {
        return Err(PathError::CreateDir {
            path: path.to_path_buf(),
            source: err,
        });
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn blob_dirs_are_created_under_base() {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path().join("nested")).expect("paths");

        let blobs = paths.blobs_dir().expect("blobs dir");
        let tmp = paths.blob_tmp_dir().expect("tmp dir");

        assert!(blobs.is_dir());
        assert!(tmp.is_dir());
        assert!(tmp.starts_with(&blobs));
        assert_eq!(paths.data_dir(), temp.path().join("nested"));
    }
}
