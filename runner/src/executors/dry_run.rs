use super::{ensure_executable, LaunchError, Launched};
use crate::invoker::Invocation;
use tracing::info;

/// Executor that only reports what would be launched
#[derive(Clone, Copy, Debug, Default)]
pub struct DryRunExecutor;

impl DryRunExecutor {
    pub fn launch(&mut self, invocation: &Invocation) -> Result<Launched, LaunchError> {
        ensure_executable(&invocation.program)?;

        info!(
            run_name = %invocation.run_name,
            cores = invocation.resources.cores,
            gpus = invocation.resources.gpus,
            "Would run {}",
            invocation.command_line()
        );

        Ok(Launched::Planned)
    }
}
