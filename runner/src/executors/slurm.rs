use super::{ensure_executable, LaunchError, Launched};
use crate::{config::ConfigErrors, invoker::Invocation};
use std::{
    collections::BTreeMap,
    path::PathBuf,
    process::{Command, Stdio},
};
use tracing::{debug, warn};

/// Executor that submits every job as its own sbatch allocation
///
/// The resource request becomes `--cpus-per-task` and `--gres=gpu:N`, the
/// training command is passed through `--wrap`.
#[derive(Clone, Debug)]
pub struct SlurmExecutor {
    sbatch: PathBuf,
    partition: Option<String>,
    time: Option<String>,
    extra: Vec<String>,
}

impl Default for SlurmExecutor {
    fn default() -> Self {
        Self {
            sbatch: PathBuf::from("sbatch"),
            partition: None,
            time: None,
            extra: Vec::new(),
        }
    }
}

fn string_parameter(
    parameters: &BTreeMap<String, serde_yaml::Value>,
    name: &str,
) -> Result<Option<String>, ConfigErrors> {
    match parameters.get(name) {
        None => Ok(None),
        Some(value) => match value.as_str() {
            Some(value) => Ok(Some(value.to_owned())),
            None => {
                warn!("executor.parameter.{name} must be a string");
                Err(ConfigErrors::InvalidExecutorParameter(name.to_owned()))
            }
        },
    }
}

impl SlurmExecutor {
    pub fn load(
        parameter: Option<&BTreeMap<String, serde_yaml::Value>>,
    ) -> Result<Self, ConfigErrors> {
        let mut executor = Self::default();

        let Some(parameters) = parameter else {
            return Ok(executor);
        };

        if let Some(sbatch) = string_parameter(parameters, "sbatch")? {
            executor.sbatch = PathBuf::from(sbatch);
        }
        executor.partition = string_parameter(parameters, "partition")?;
        executor.time = string_parameter(parameters, "time")?;

        if let Some(extra) = parameters.get("extra") {
            executor.extra = serde_yaml::from_value(extra.clone()).map_err(|error| {
                warn!("executor.parameter.extra must be a list of strings: {error}");
                ConfigErrors::InvalidExecutorParameter("extra".to_owned())
            })?;
        }

        Ok(executor)
    }

    /// arguments passed to sbatch for one job
    pub fn arguments(&self, invocation: &Invocation) -> Vec<String> {
        let mut arguments = vec![
            "--parsable".to_owned(),
            format!("--job-name={}", invocation.run_name),
            format!("--cpus-per-task={}", invocation.resources.cores),
        ];

        if invocation.resources.gpus > 0 {
            arguments.push(format!("--gres=gpu:{}", invocation.resources.gpus));
        }
        arguments.push(format!("--output={}", invocation.output.to_string_lossy()));
        if let Some(ref partition) = self.partition {
            arguments.push(format!("--partition={partition}"));
        }
        if let Some(ref time) = self.time {
            arguments.push(format!("--time={time}"));
        }
        arguments.extend(self.extra.iter().cloned());
        arguments.push(format!("--wrap={}", invocation.command_line()));

        arguments
    }

    /// submit the job, a refusal by sbatch is a launch error
    pub fn launch(&mut self, invocation: &Invocation) -> Result<Launched, LaunchError> {
        ensure_executable(&invocation.program)?;

        let output = Command::new(&self.sbatch)
            .args(self.arguments(invocation))
            .stdin(Stdio::null())
            .output()?;

        if !output.status.success() {
            return Err(LaunchError::Rejected {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let job_id = parse_job_id(&stdout)?;

        debug!(job_id = job_id, "sbatch accepted {}", invocation.run_name);

        Ok(Launched::Submitted { job_id })
    }
}

/// read the job id from `--parsable` output (`id[;cluster]`) or from the
/// human readable `Submitted batch job <id>`
pub fn parse_job_id(stdout: &str) -> Result<u64, LaunchError> {
    stdout
        .lines()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| line.split(';').next())
        .and_then(|id| id.split_whitespace().last())
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| LaunchError::UnexpectedResponse(stdout.to_owned()))
}
