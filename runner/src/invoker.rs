use crate::{
    config::SweepConfig,
    executors::{Executors, LaunchError, Launched},
    resources::ResourceRequest,
    state::{CleanupError, RunStateStore},
    sweep::JobDescriptor,
};
use std::{borrow::Cow, path::PathBuf};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum InvokeError {
    #[error(transparent)]
    Cleanup(#[from] CleanupError),
    #[error("failed to launch run '{run_name}': {source}")]
    Launch {
        run_name: String,
        #[source]
        source: LaunchError,
    },
}

impl InvokeError {
    /// the run state area is gone, continuing would fail for every other job
    pub fn is_systemic(&self) -> bool {
        matches!(self, Self::Cleanup(CleanupError { systemic: true, .. }))
    }
}

/// Everything needed to start one job of the sweep
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub run_name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub resources: ResourceRequest,
    // where a detached local launch writes stdout/ stderr
    pub output: PathBuf,
}

impl Invocation {
    /// build the argument list expected by the training program's parser
    pub fn new(config: &SweepConfig, descriptor: &JobDescriptor, output: PathBuf) -> Self {
        let training = &config.training;
        let paths = &config.paths;

        let mut args = vec![descriptor.run_name.clone()];
        let mut flag = |name: &str, value: String| {
            args.push(format!("--{name}"));
            args.push(value);
        };

        flag("num-processes", descriptor.workers.to_string());
        flag("log-interval", training.log_interval.to_string());
        // the checkpoint is always named after the run
        flag("checkpoint-name", descriptor.run_name.clone());
        flag("resume", training.resume.to_string());
        if let Some(ref source) = paths.checkpoint_source {
            flag("checkpoint-lname", source.to_string_lossy().into_owned());
        }
        flag("lr", training.lr.to_string());
        flag("batch-size", descriptor.batch_size.to_string());
        flag("tmp-dir", paths.tmp_dir().to_string_lossy().into_owned());
        flag("final-dir", paths.final_dir.to_string_lossy().into_owned());
        if let Some(ref attack) = training.attack_checkpoint_path {
            flag("attack-checkpoint-path", attack.clone());
        }
        flag("max-steps", descriptor.max_steps.to_string());
        flag("optimizer", descriptor.optimizer.to_string());

        args.extend(config.program.extra_args.iter().cloned());
        args.push(config.program.mode.clone());

        Self {
            run_name: descriptor.run_name.clone(),
            program: config.program.exec.clone(),
            args,
            resources: config.resources.request(descriptor.workers),
            output,
        }
    }

    /// shell representation of the full command, used for logging and wrapping
    pub fn command_line(&self) -> String {
        std::iter::once(shell_quote(&self.program.to_string_lossy()).into_owned())
            .chain(self.args.iter().map(|arg| shell_quote(arg).into_owned()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// quote a word for POSIX shells, plain words are passed through
pub fn shell_quote(word: &str) -> Cow<'_, str> {
    let is_plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c));

    if is_plain {
        Cow::Borrowed(word)
    } else {
        Cow::Owned(format!("'{}'", word.replace('\'', r"'\''")))
    }
}

/// Result of running a whole sweep, in launch order
#[derive(Debug, Default)]
pub struct SweepReport {
    pub launched: Vec<(String, Launched)>,
    pub failed: Vec<(String, InvokeError)>,
    // set when a systemic cleanup failure stopped the sweep early
    pub aborted: bool,
}

impl SweepReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.aborted
    }
}

pub struct Invoker<'a, S: RunStateStore> {
    config: &'a SweepConfig,
    store: S,
    executor: Executors,
}

impl<'a, S: RunStateStore> Invoker<'a, S> {
    pub fn new(config: &'a SweepConfig, store: S, executor: Executors) -> Self {
        Self {
            config,
            store,
            executor,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn invocation(&self, descriptor: &JobDescriptor) -> Invocation {
        let output = self.store.paths_for(&descriptor.run_name).output;

        Invocation::new(self.config, descriptor, output)
    }

    /// reset the run state of a single job, then launch it
    ///
    /// Nothing is launched if the reset fails.
    #[instrument(skip_all, fields(run_name = %descriptor.run_name), level = "info")]
    pub fn launch(&mut self, descriptor: &JobDescriptor) -> Result<Launched, InvokeError> {
        let invocation = self.invocation(descriptor);

        // a dry run must not touch the scratch area
        if self.executor.touches_state() {
            self.store.reset(&descriptor.run_name)?;
        }

        let launched = self
            .executor
            .launch(&invocation)
            .map_err(|source| InvokeError::Launch {
                run_name: descriptor.run_name.clone(),
                source,
            })?;

        info!(
            cores = invocation.resources.cores,
            gpus = invocation.resources.gpus,
            launched = %launched,
            "Launched job {}",
            descriptor.index + 1
        );

        Ok(launched)
    }

    /// launch every descriptor in order
    ///
    /// A failing job does not stop the sweep, unless the scratch area
    /// itself is unusable.
    #[instrument(skip_all, fields(jobs = descriptors.len()), level = "info")]
    pub fn run(&mut self, descriptors: &[JobDescriptor]) -> SweepReport {
        let mut report = SweepReport::default();

        for (position, descriptor) in descriptors.iter().enumerate() {
            match self.launch(descriptor) {
                Ok(launched) => report
                    .launched
                    .push((descriptor.run_name.clone(), launched)),
                Err(error) => {
                    error!(run_name = %descriptor.run_name, error = %error, "Job failed");

                    let systemic = error.is_systemic();
                    report.failed.push((descriptor.run_name.clone(), error));

                    if systemic {
                        warn!(
                            remaining = descriptors.len() - position - 1,
                            "Scratch area is unusable, aborting the remaining sweep"
                        );
                        report.aborted = true;
                        break;
                    }
                }
            }
        }

        info!(
            launched = report.launched.len(),
            failed = report.failed.len(),
            "Done with launching"
        );

        report
    }
}
