//! Prepares the directory that holds per-plugin rendezvous sockets and
//! shared-memory regions.
//!
//! The host and every plugin it spawns must agree on this location. The
//! directory is created with owner-only permissions so other users cannot
//! connect to a plugin's socket or map its region.

use std::fs::DirBuilder;
use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

/// Ensures `path` exists as a directory with restrictive permissions.
///
/// An already existing directory is accepted as-is.
pub fn prepare_runtime_dir(path: &Utf8Path) -> Result<(), RuntimeDirError> {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }

    if let Err(source) = builder.create(path.as_std_path())
        && source.kind() != io::ErrorKind::AlreadyExists
    {
        return Err(RuntimeDirError::Create {
            path: path.to_path_buf(),
            source: Arc::new(source),
        });
    }

    if !path.is_dir() {
        return Err(RuntimeDirError::NotDirectory {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Errors raised while preparing the runtime directory.
#[derive(Debug, Clone, Error)]
pub enum RuntimeDirError {
    /// Creating the directory failed.
    #[error("failed to prepare runtime directory '{path}': {source}")]
    Create {
        /// Directory that could not be created.
        path: Utf8PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: Arc<io::Error>,
    },
    /// A non-directory entry occupies the path.
    #[error("runtime path '{path}' exists but is not a directory")]
    NotDirectory {
        /// Offending path.
        path: Utf8PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    use super::*;

    fn utf8_root(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 temp path")
    }

    #[test]
    fn creates_nested_directories() {
        let dir = TempDir::new().expect("temp dir");
        let target = utf8_root(&dir).join("a").join("b");
        prepare_runtime_dir(&target).expect("prepare runtime dir");
        assert!(target.is_dir());
    }

    #[test]
    fn accepts_existing_directory() {
        let dir = TempDir::new().expect("temp dir");
        let target = utf8_root(&dir);
        prepare_runtime_dir(&target).expect("existing dir is fine");
    }

    #[test]
    fn rejects_regular_file() {
        let dir = TempDir::new().expect("temp dir");
        let target = utf8_root(&dir).join("occupied");
        fs::write(&target, b"x").expect("write file");
        let error = prepare_runtime_dir(&target).expect_err("file must be rejected");
        assert!(matches!(
            error,
            RuntimeDirError::NotDirectory { .. } | RuntimeDirError::Create { .. }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn new_directory_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().expect("temp dir");
        let target = utf8_root(&dir).join("sockets");
        prepare_runtime_dir(&target).expect("prepare runtime dir");
        let mode = fs::metadata(&target).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o077, 0, "group/other bits set: {mode:o}");
    }
}
