// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount-target precondition check.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MountTargetError {
    #[error("mount target {0} is not empty")]
    NotEmpty(PathBuf),
    #[error("mount target {0} exists but is not a directory")]
    NotADirectory(PathBuf),
    #[error("failed to prepare mount target {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Create `path` (with parents) if absent, or verify that the existing
/// directory is empty. Idempotent; runs before anything privileged so a
/// bad target never costs a helper fork.
pub fn ensure_empty_directory(path: &Path) -> Result<(), MountTargetError> {
    let io_err = |source| MountTargetError::Io {
        path: path.to_path_buf(),
        source,
    };
    match fs::metadata(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "creating mount target");
            fs::create_dir_all(path).map_err(io_err)
        }
        Err(err) => Err(io_err(err)),
        Ok(meta) if !meta.is_dir() => Err(MountTargetError::NotADirectory(path.to_path_buf())),
        Ok(_) => {
            let mut entries = fs::read_dir(path).map_err(io_err)?;
            match entries.next() {
                Some(_) => Err(MountTargetError::NotEmpty(path.to_path_buf())),
                None => Ok(()),
            }
        }
    }
}
