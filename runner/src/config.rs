use crate::{
    resources::ResourceRule,
    sweep::{self, JobDescriptor, SweepError, SweepSpec},
};
use nix::unistd::{access, AccessFlags};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match fs::metadata(path) {
            Ok(metadata) => Ok((metadata.mode() & 0o111) != 0),
            Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read { path: PathBuf, source: Error },
    #[error("Config file is not valid: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Sweep is not valid: {0}")]
    Sweep(#[from] SweepError),
    #[error("Preflight checks failed, see the log above")]
    Preflight,
    #[error("Run {0} is not part of the sweep")]
    UnknownRun(String),
    #[error("Executor not supported: {0}")]
    UnsupportedExecutor(String),
    #[error("Executor parameter {0} is invalid")]
    InvalidExecutorParameter(String),
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    // external training program and how it is called
    pub program: ProgramConfig,
    pub paths: PathsConfig,
    // parameters shared by every job of the sweep
    pub training: TrainingConfig,
    #[serde(default)]
    pub resources: ResourceRule,
    pub sweep: SweepSpec,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ProgramConfig {
    pub exec: PathBuf,
    // trailing positional tag, e.g. `baseline`
    #[serde(default = "default_mode")]
    pub mode: String,
    // appended verbatim in front of the mode tag
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,
    // falls back to the scratch root
    pub tmp_dir: Option<PathBuf>,
    pub final_dir: PathBuf,
    // passed as --checkpoint-lname when set
    pub checkpoint_source: Option<PathBuf>,
}

impl PathsConfig {
    pub fn tmp_dir(&self) -> &Path {
        self.tmp_dir.as_deref().unwrap_or(self.scratch_root.as_path())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct TrainingConfig {
    pub lr: f64,
    #[serde(default = "default_num_processes")]
    pub num_processes: u32,
    #[serde(default = "default_log_interval")]
    pub log_interval: u32,
    #[serde(default = "default_resume")]
    pub resume: i64,
    pub attack_checkpoint_path: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    // Name of the selected executor, see Executors::load for the selection proccess
    pub name: String,
    // parameters for the executor that apply over all jobs
    pub parameter: Option<BTreeMap<String, serde_yaml::Value>>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "local".to_owned(),
            parameter: None,
        }
    }
}

impl FromStr for SweepConfig {
    type Err = ConfigErrors;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(serde_yaml::from_str(value)?)
    }
}

impl SweepConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        fs::read_to_string(path)
            .map_err(|source| ConfigErrors::Read {
                path: path.to_path_buf(),
                source,
            })?
            .parse()
    }

    /// expand the sweep section into the ordered list of jobs
    pub fn descriptors(&self) -> Result<Vec<JobDescriptor>, SweepError> {
        sweep::expand(
            &self.sweep,
            &self.program.mode,
            self.training.num_processes,
        )
    }

    /// log every problem of the config, returns true if any of them is fatal
    ///
    /// Executors that leave the run state alone only get warnings about the
    /// scratch root.
    pub fn preflight_checks(&self, touches_state: bool) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if let Err(e) = self.descriptors() {
            error!("sweep cannot be expanded: {e}");
            contains_error = true;
        }

        if self.training.num_processes == 0 {
            error!("training.num_processes must be at least 1");
            contains_error = true;
        } else if self.program.mode == "baseline" && self.training.num_processes > 1 {
            warn!(
                "training.num_processes is {} but baseline runs only support a single process",
                self.training.num_processes
            );
        }

        if !self.training.lr.is_finite() || self.training.lr <= 0.0 {
            error!("training.lr must be a positive number, got {}", self.training.lr);
            contains_error = true;
        }

        if self.program.mode.is_empty() {
            error!("program.mode cannot be empty");
            contains_error = true;
        }

        // launching re-checks the program for each job, this only warns early
        match check_executable(&self.program.exec) {
            Ok(true) => {}
            Ok(false) => warn!(
                "program.exec {} is not executable, every launch will fail",
                self.program.exec.to_string_lossy()
            ),
            Err(e) => warn!(
                "Failed to determine if program.exec ({}) is an executable: {e}",
                self.program.exec.to_string_lossy()
            ),
        }

        let scratch_root = &self.paths.scratch_root;
        let scratch_problem = if !scratch_root.is_dir() {
            Some("is not a directory".to_owned())
        } else {
            access(scratch_root.as_path(), AccessFlags::W_OK | AccessFlags::X_OK)
                .err()
                .map(|errno| format!("is not writable ({errno})"))
        };

        if let Some(problem) = scratch_problem {
            if touches_state {
                error!(
                    "paths.scratch_root {} {problem}",
                    scratch_root.to_string_lossy()
                );
                contains_error = true;
            } else {
                warn!(
                    "paths.scratch_root {} {problem}",
                    scratch_root.to_string_lossy()
                );
            }
        }

        contains_error
    }
}

fn default_mode() -> String {
    "baseline".to_owned()
}

fn default_scratch_root() -> PathBuf {
    PathBuf::from("/scratch")
}

fn default_num_processes() -> u32 {
    1
}

fn default_log_interval() -> u32 {
    200
}

fn default_resume() -> i64 {
    -1
}
