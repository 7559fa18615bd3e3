use super::{ensure_executable, LaunchError, Launched};
use crate::{config::ConfigErrors, invoker::Invocation};
use std::{
    collections::BTreeMap,
    fs::File,
    process::{Command, Stdio},
};
use tracing::{debug, warn};

/// Executor that starts jobs as detached processes on this machine
#[derive(Clone, Debug, Default)]
pub struct LocalExecutor {
    // extra environment for every job, e.g. OMP_NUM_THREADS
    env: BTreeMap<String, String>,
}

impl LocalExecutor {
    pub fn load(
        parameter: Option<&BTreeMap<String, serde_yaml::Value>>,
    ) -> Result<Self, ConfigErrors> {
        let mut env = BTreeMap::new();

        if let Some(value) = parameter.and_then(|parameters| parameters.get("env")) {
            let Some(mapping) = value.as_mapping() else {
                warn!("executor.parameter.env must be a map of variable names to values");
                return Err(ConfigErrors::InvalidExecutorParameter("env".to_owned()));
            };

            for (key, value) in mapping {
                let value = match value {
                    serde_yaml::Value::String(value) => Some(value.clone()),
                    serde_yaml::Value::Number(value) => Some(value.to_string()),
                    serde_yaml::Value::Bool(value) => Some(value.to_string()),
                    _ => None,
                };

                match (key.as_str(), value) {
                    (Some(name), Some(value)) => {
                        env.insert(name.to_owned(), value);
                    }
                    _ => {
                        warn!("executor.parameter.env.{key:?} must be a plain name with a scalar value");
                        return Err(ConfigErrors::InvalidExecutorParameter(format!("env.{key:?}")));
                    }
                }
            }
        }

        Ok(Self { env })
    }

    /// spawn the job and return its pid, the child is never waited on
    pub fn launch(&mut self, invocation: &Invocation) -> Result<Launched, LaunchError> {
        ensure_executable(&invocation.program)?;

        let output = File::create(&invocation.output).map_err(|source| LaunchError::Output {
            path: invocation.output.clone(),
            source,
        })?;
        let errors = output.try_clone().map_err(|source| LaunchError::Output {
            path: invocation.output.clone(),
            source,
        })?;

        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(output)
            .stderr(errors)
            .spawn()?;

        debug!(
            pid = child.id(),
            output = ?invocation.output,
            "Spawned {}",
            invocation.command_line()
        );

        Ok(Launched::Process { pid: child.id() })
    }
}
