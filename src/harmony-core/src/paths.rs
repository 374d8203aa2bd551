use crate::{APP_AUTHOR, APP_NAME, APP_QUALIFIER};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct AppDirs {
    config_dir: PathBuf,
    data_dir: PathBuf,
    log_dir: PathBuf,
}

impl AppDirs {
    pub fn discover() -> Result<Self, DirsError> {
        let dirs = ProjectDirs::from(APP_QUALIFIER, APP_AUTHOR, APP_NAME)
            .ok_or(DirsError::MissingProjectDirs)?;
        let log_dir = dirs.data_dir().join("logs");
        Ok(Self {
            config_dir: dirs.config_dir().to_path_buf(),
            data_dir: dirs.data_dir().to_path_buf(),
            log_dir,
        })
    }

    /// Lay out all directories under a single root.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
            log_dir: root.join("data").join("logs"),
        }
    }

    pub fn ensure_exists(&self) -> Result<(), DirsError> {
        for dir in [&self.config_dir, &self.data_dir, &self.log_dir] {
            std::fs::create_dir_all(dir).map_err(|source| DirsError::CreateDirectory {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

#[derive(Debug, Error)]
pub enum DirsError {
    #[error("unable to determine project directories for tk-harmony")]
    MissingProjectDirs,
    #[error("failed to create directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Normalise a path the way the peer expects it.
///
/// The result is absolute, has symlinks resolved when the path exists, and
/// always uses `/` as separator.
pub fn normalize_path(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    let resolved = std::fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf());
    let rendered = resolved.to_string_lossy().replace('\\', "/");
    // canonicalize on Windows yields verbatim paths
    match rendered.strip_prefix("//?/") {
        Some(stripped) => stripped.to_string(),
        None => rendered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_returns_dirs() {
        let dirs = AppDirs::discover().expect("should build dirs");
        assert!(dirs.log_dir().ends_with("logs"));
    }

    #[test]
    fn rooted_dirs_are_created() {
        let root = tempfile::tempdir().unwrap();
        let dirs = AppDirs::rooted_at(root.path());
        dirs.ensure_exists().unwrap();
        assert!(dirs.config_dir().is_dir());
        assert!(dirs.log_dir().is_dir());
    }

    #[test]
    fn normalized_paths_are_absolute_with_forward_slashes() {
        let root = tempfile::tempdir().unwrap();
        let scene = root.path().join("scene.xstage");
        std::fs::write(&scene, b"").unwrap();

        let normalized = normalize_path(&scene);
        assert!(!normalized.contains('\\'));
        assert!(normalized.ends_with("/scene.xstage"));
        assert!(Path::new(&normalized).is_absolute());
    }

    #[test]
    fn missing_paths_are_still_absolutized() {
        let normalized = normalize_path("does/not/exist.xstage");
        assert!(Path::new(&normalized).is_absolute());
        assert!(normalized.ends_with("does/not/exist.xstage"));
    }
}
