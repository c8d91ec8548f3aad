use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use liteport_core::{CleanupError, WriteError};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::OverwritePolicy;

/// Write `bytes` to `path` through a synced temporary file in the same
/// directory, so `path` is either untouched or complete.
pub fn write_atomic(path: &Path, bytes: &[u8], policy: OverwritePolicy) -> Result<(), WriteError> {
    let io = |source: std::io::Error| WriteError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir).map_err(io)?;
    tmp.write_all(bytes).map_err(io)?;
    tmp.as_file().sync_all().map_err(io)?;

    match policy {
        OverwritePolicy::Replace => {
            tmp.persist(path).map_err(|err| io(err.error))?;
        }
        OverwritePolicy::Fail => {
            tmp.persist_noclobber(path).map_err(|err| {
                if err.error.kind() == ErrorKind::AlreadyExists {
                    WriteError::OutputExists(path.to_path_buf())
                } else {
                    io(err.error)
                }
            })?;
        }
    }
    debug!(path = %path.display(), bytes = bytes.len(), ?policy, "wrote output");
    Ok(())
}

/// Scoped intermediate file. [`IntermediateFile::release`] deletes it after a
/// successful run; dropping it unreleased means the run failed, and the file
/// is kept or removed according to `keep_on_failure`.
#[derive(Debug)]
pub struct IntermediateFile {
    path: PathBuf,
    keep_on_failure: bool,
    released: bool,
}

impl IntermediateFile {
    pub fn new(path: impl Into<PathBuf>, keep_on_failure: bool) -> Self {
        Self {
            path: path.into(),
            keep_on_failure,
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<(), CleanupError> {
        self.released = true;
        std::fs::remove_file(&self.path).map_err(|source| {
            if source.kind() == ErrorKind::NotFound {
                CleanupError::Missing(self.path.clone())
            } else {
                CleanupError::Io {
                    path: self.path.clone(),
                    source,
                }
            }
        })?;
        debug!(path = %self.path.display(), "removed intermediate file");
        Ok(())
    }
}

impl Drop for IntermediateFile {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.keep_on_failure {
            if self.path.exists() {
                warn!(path = %self.path.display(), "conversion failed, keeping intermediate file");
            }
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed intermediate file after failure"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), error = %err, "could not remove intermediate file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fail_policy_leaves_existing_output_untouched() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("model.lpfb");
        std::fs::write(&path, b"original")?;

        let err = write_atomic(&path, b"replacement", OverwritePolicy::Fail).unwrap_err();
        assert!(matches!(err, WriteError::OutputExists(_)));
        assert_eq!(std::fs::read(&path)?, b"original");
        // no stray temporary files
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn replace_policy_overwrites() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("model.lpfb");
        std::fs::write(&path, b"original")?;
        write_atomic(&path, b"replacement", OverwritePolicy::Replace)?;
        assert_eq!(std::fs::read(&path)?, b"replacement");
        Ok(())
    }

    #[test]
    fn missing_output_directory_is_io_error() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("absent").join("model.lpfb");
        let err = write_atomic(&path, b"x", OverwritePolicy::Fail).unwrap_err();
        assert!(matches!(err, WriteError::Io { .. }));
        Ok(())
    }

    #[test]
    fn released_intermediate_is_deleted() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("model.intermediate");
        std::fs::write(&path, b"x")?;
        IntermediateFile::new(&path, true).release()?;
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn releasing_a_vanished_intermediate_reports_missing() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let guard = IntermediateFile::new(dir.path().join("gone.intermediate"), true);
        assert!(matches!(guard.release(), Err(CleanupError::Missing(_))));
        Ok(())
    }

    #[test]
    fn dropped_intermediate_follows_failure_policy() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let kept = dir.path().join("kept.intermediate");
        let removed = dir.path().join("removed.intermediate");
        std::fs::write(&kept, b"x")?;
        std::fs::write(&removed, b"x")?;

        drop(IntermediateFile::new(&kept, true));
        drop(IntermediateFile::new(&removed, false));
        assert!(kept.exists());
        assert!(!removed.exists());
        Ok(())
    }
}
