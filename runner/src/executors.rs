mod dry_run;
mod local;
mod slurm;

pub use dry_run::DryRunExecutor;
pub use local::LocalExecutor;
pub use slurm::SlurmExecutor;

use crate::{
    config::{check_executable, ConfigErrors, ExecutorConfig},
    invoker::Invocation,
};
use std::{fmt, io, path::Path, path::PathBuf, process::ExitStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("program {} does not exist", .0.display())]
    ProgramNotFound(PathBuf),
    #[error("program {} is not executable", .0.display())]
    NotExecutable(PathBuf),
    #[error("failed to open output file {}: {source}", path.display())]
    Output { path: PathBuf, source: io::Error },
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("scheduler rejected the submission ({status}): {stderr}")]
    Rejected { status: ExitStatus, stderr: String },
    #[error("unexpected scheduler response: {0:?}")]
    UnexpectedResponse(String),
}

/// What a successful launch handed back, the job itself is not supervised
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launched {
    Process { pid: u32 },
    Submitted { job_id: u64 },
    Planned,
}

impl fmt::Display for Launched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process { pid } => write!(f, "pid {pid}"),
            Self::Submitted { job_id } => write!(f, "job {job_id}"),
            Self::Planned => f.write_str("dry run"),
        }
    }
}

#[derive(Clone, Debug)]
pub enum Executors {
    Local(LocalExecutor),
    Slurm(SlurmExecutor),
    DryRun(DryRunExecutor),
}

impl Executors {
    pub fn load(config: &ExecutorConfig) -> Result<Self, ConfigErrors> {
        let parameter = config.parameter.as_ref();

        match config.name.to_lowercase().as_str() {
            "local" => Ok(Self::Local(LocalExecutor::load(parameter)?)),
            "slurm" => Ok(Self::Slurm(SlurmExecutor::load(parameter)?)),
            "dry-run" | "dry_run" => Ok(Self::DryRun(DryRunExecutor)),
            _ => Err(ConfigErrors::UnsupportedExecutor(config.name.clone())),
        }
    }

    /// launch one job and return without waiting for it
    pub fn launch(&mut self, invocation: &Invocation) -> Result<Launched, LaunchError> {
        match self {
            Self::Local(executor) => executor.launch(invocation),
            Self::Slurm(executor) => executor.launch(invocation),
            Self::DryRun(executor) => executor.launch(invocation),
        }
    }

    /// false if launching leaves the run state area untouched
    pub fn touches_state(&self) -> bool {
        !matches!(self, Self::DryRun(_))
    }
}

// the launch itself re-checks the program, config checks may be stale
fn ensure_executable(program: &Path) -> Result<(), LaunchError> {
    match check_executable(program) {
        Ok(true) => Ok(()),
        Ok(false) => Err(LaunchError::NotExecutable(program.to_path_buf())),
        Err(ConfigErrors::MetadataNotFound(error)) => Err(LaunchError::Spawn(error)),
        Err(_) => Err(LaunchError::ProgramNotFound(program.to_path_buf())),
    }
}

#[cfg(test)]
mod executors_test;
