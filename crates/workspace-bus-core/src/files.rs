//! Filesystem-backed [`FileLoader`].

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::traits::{FileError, FileLoader};

/// Serves files below a fixed root directory.
///
/// Paths are resolved relative to the root; absolute paths and `..`
/// components are refused so embedded content cannot escape it.
#[derive(Debug, Clone)]
pub struct FsFileLoader {
    root: PathBuf,
}

impl FsFileLoader {
    /// Create a loader rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, FileError> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(FileError::InvalidPath(path.to_owned()));
                }
            }
        }
        if resolved == self.root {
            return Err(FileError::InvalidPath(path.to_owned()));
        }
        Ok(resolved)
    }
}

#[async_trait]
impl FileLoader for FsFileLoader {
    async fn load(&self, path: &str) -> Result<String, FileError> {
        let full = self.resolve(path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FileError::NotFound(path.to_owned()))
            }
            Err(source) => Err(FileError::Io {
                path: path.to_owned(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    #[tokio::test]
    async fn test_loads_file_below_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/readme.md"), "# hi").unwrap();

        let loader = FsFileLoader::new(dir.path());
        let content = assert_ok!(loader.load("docs/readme.md").await);
        assert_eq!(content, "# hi");
        let content = assert_ok!(loader.load("/docs/./readme.md").await);
        assert_eq!(content, "# hi");
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let loader = FsFileLoader::new(dir.path());
        let err = assert_err!(loader.load("nope.txt").await);
        assert!(matches!(err, FileError::NotFound(p) if p == "nope.txt"));
    }

    #[tokio::test]
    async fn test_refuses_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let loader = FsFileLoader::new(dir.path());
        let err = assert_err!(loader.load("../etc/passwd").await);
        assert!(matches!(err, FileError::InvalidPath(_)));
        let err = assert_err!(loader.load("").await);
        assert!(matches!(err, FileError::InvalidPath(_)));
    }
}
