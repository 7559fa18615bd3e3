//! Filesystem state owned by a single run name.
//!
//! Every run keeps a status marker, a working directory, a bias file and the
//! captured output of a local launch directly below the scratch root. The
//! external training program creates and mutates them, this crate only ever
//! resets them before a launch.

use nix::unistd::{access, AccessFlags};
use once_cell::sync::Lazy;
use std::{
    ffi::{OsStr, OsString},
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
#[error("failed to reset state of run '{run_name}' at {}: {source}", path.display())]
pub struct CleanupError {
    pub run_name: String,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
    /// the scratch root itself is unusable, every later reset will fail too
    pub systemic: bool,
}

pub static STATUS_SUFFIX: Lazy<OsString> = Lazy::new(|| OsString::from(".status"));
pub static WORKDIR_SUFFIX: Lazy<OsString> = Lazy::new(|| OsString::from(".hogwild"));
pub static BIAS_SUFFIX: Lazy<OsString> = Lazy::new(|| OsString::from(".bias"));
pub static OUTPUT_SUFFIX: Lazy<OsString> = Lazy::new(|| OsString::from(".out"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub status: PathBuf,
    pub workdir: PathBuf,
    pub bias: PathBuf,
    pub output: PathBuf,
}

/// Key-value view over the run state area, keyed by run name
pub trait RunStateStore {
    /// locations of all artifacts of `run_name`, nothing is touched
    fn paths_for(&self, run_name: &str) -> RunPaths;

    /// remove the status marker and working directory, leave an empty bias
    /// file behind
    ///
    /// Does not assume a clean shutdown of a previous run and is
    /// idempotent.
    fn reset(&self, run_name: &str) -> Result<RunPaths, CleanupError>;
}

/// Run state stored as plain files below a scratch directory
#[derive(Debug, Clone)]
pub struct ScratchStore {
    root: PathBuf,
}

impl ScratchStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// true if the scratch root exists and entries can be created in it
    pub fn is_reachable(&self) -> bool {
        self.root.is_dir()
            && access(self.root.as_path(), AccessFlags::W_OK | AccessFlags::X_OK).is_ok()
    }

    fn join(&self, run_name: &str, suffix: &OsStr) -> PathBuf {
        let mut file_name = OsString::with_capacity(run_name.len() + suffix.len());
        file_name.push(run_name);
        file_name.push(suffix);

        self.root.join(file_name)
    }

    fn cleanup_error(&self, run_name: &str, path: &Path, source: io::Error) -> CleanupError {
        CleanupError {
            run_name: run_name.to_owned(),
            path: path.to_path_buf(),
            source,
            systemic: !self.is_reachable(),
        }
    }
}

impl RunStateStore for ScratchStore {
    fn paths_for(&self, run_name: &str) -> RunPaths {
        RunPaths {
            status: self.join(run_name, &STATUS_SUFFIX),
            workdir: self.join(run_name, &WORKDIR_SUFFIX),
            bias: self.join(run_name, &BIAS_SUFFIX),
            output: self.join(run_name, &OUTPUT_SUFFIX),
        }
    }

    fn reset(&self, run_name: &str) -> Result<RunPaths, CleanupError> {
        let paths = self.paths_for(run_name);

        // order matters: marker first, then the directory, then the bias file
        for path in [&paths.status, &paths.workdir, &paths.output] {
            remove_any(path).map_err(|error| self.cleanup_error(run_name, path, error))?;
        }

        // only a regular file may be truncated in place, a symlink would be followed
        if let Ok(metadata) = fs::symlink_metadata(&paths.bias) {
            if !metadata.is_file() {
                remove_any(&paths.bias)
                    .map_err(|error| self.cleanup_error(run_name, &paths.bias, error))?;
            }
        }

        File::create(&paths.bias)
            .map_err(|error| self.cleanup_error(run_name, &paths.bias, error))?;

        info!(run_name = %run_name, root = ?self.root, "Reset run state");

        Ok(paths)
    }
}

/// remove a file, symlink or directory tree, a missing path is fine
fn remove_any(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(error) => Err(error),
    };

    match result {
        Ok(()) => {
            debug!(path = ?path, "Removed stale run artifact");
            Ok(())
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod state_test;
