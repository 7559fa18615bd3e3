//! Declarative submission file for an HTCondor style batch scheduler.
//!
//! The expanded sweep maps onto one `queue ... from ( ... )` block per batch
//! size. The resource request stays a formula over the `workers` macro so
//! the scheduler recomputes it if the worker count is edited by hand.

use crate::{
    config::SweepConfig,
    invoker::Invocation,
    state::{RunStateStore, ScratchStore},
    sweep::{JobDescriptor, SweepError},
};
use itertools::Itertools;
use std::borrow::Cow;

// values that vary per job are replaced by submit macros
fn macro_for(flag: &str) -> Option<&'static str> {
    match flag {
        "--num-processes" => Some("$(workers)"),
        "--checkpoint-name" => Some("$(run_name)"),
        "--batch-size" => Some("$(batch_size)"),
        "--max-steps" => Some("$(max_steps)"),
        "--optimizer" => Some("$(optimizer)"),
        _ => None,
    }
}

/// quote one argument for the double quoted `arguments` syntax
fn condor_quote(word: &str) -> Cow<'_, str> {
    let is_plain = !word.is_empty()
        && !word
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '"');

    if is_plain {
        Cow::Borrowed(word)
    } else {
        Cow::Owned(format!(
            "'{}'",
            word.replace('\'', "''").replace('"', "\"\"")
        ))
    }
}

fn argument_template(invocation: &Invocation) -> String {
    let mut previous: Option<&str> = None;

    invocation
        .args
        .iter()
        .enumerate()
        .map(|(index, arg)| {
            let value = match (index, previous.and_then(macro_for)) {
                (0, _) => Cow::Borrowed("$(run_name)"),
                (_, Some(replacement)) => Cow::Borrowed(replacement),
                _ => condor_quote(arg),
            };
            previous = Some(arg.as_str());

            value
        })
        .join(" ")
}

/// render the submission file for every descriptor of the sweep
pub fn render(config: &SweepConfig, descriptors: &[JobDescriptor]) -> Result<String, SweepError> {
    let first = descriptors.first().ok_or(SweepError::EmptySweep)?;

    // queue items are split on whitespace and commas
    if let Some(descriptor) = descriptors
        .iter()
        .find(|descriptor| descriptor.run_name.contains(|c: char| c.is_whitespace() || c == ','))
    {
        return Err(SweepError::InvalidRunName(descriptor.run_name.clone()));
    }

    let store = ScratchStore::new(&config.paths.scratch_root);
    let invocation = Invocation::new(config, first, store.paths_for(&first.run_name).output);
    let scratch = config.paths.scratch_root.to_string_lossy();
    let rule = &config.resources;

    let header = format!(
        "# {jobs} jobs over {batches} batch sizes\n\
         # reset run state with `hogsweep reset` before (re)queueing a run\n\
         universe     = vanilla\n\
         executable   = {exec}\n\
         getenv       = true\n\
         workers      = {workers}\n\
         request_cpus = $(workers) * {per_worker} + {base}\n\
         request_gpus = {gpus}\n\
         output       = {scratch}/$(run_name).out\n\
         error        = {scratch}/$(run_name).err\n\
         log          = {scratch}/hogsweep.log\n\
         arguments    = \"{arguments}\"\n",
        jobs = descriptors.len(),
        batches = descriptors.iter().map(|job| job.batch_size).unique().count(),
        exec = config.program.exec.to_string_lossy(),
        workers = first.workers,
        per_worker = rule.cores_per_worker,
        base = rule.base_cores,
        gpus = rule.gpus,
        arguments = argument_template(&invocation),
    );

    let groups = descriptors.iter().group_by(|job| job.batch_size);
    let queues = groups
        .into_iter()
        .map(|(batch_size, group)| {
            let items = group
                .map(|job| format!("  {}, {}, {}\n", job.run_name, job.optimizer, job.max_steps))
                .join("");

            format!(
                "\nbatch_size = {batch_size}\nqueue run_name, optimizer, max_steps from (\n{items})\n"
            )
        })
        .join("");

    Ok(header + &queues)
}

#[cfg(test)]
mod tests {
    use super::{condor_quote, render};
    use crate::{
        config::{config_test::sample_yaml, SweepConfig},
        sweep::{RunNameTemplate, SweepError},
    };
    use std::path::Path;

    fn config() -> SweepConfig {
        sample_yaml(Path::new("/opt/main.py"), Path::new("/scratch"))
            .parse()
            .unwrap()
    }

    #[test]
    fn one_queue_block_per_batch_size() {
        let config = config();
        let descriptors = config.descriptors().unwrap();
        let file = render(&config, &descriptors).unwrap();

        assert!(file.starts_with("# 12 jobs over 4 batch sizes\n"));
        assert!(file.contains("request_cpus = $(workers) * 6 + 3\n"));
        assert!(file.contains("request_gpus = 1\n"));
        assert_eq!(file.matches("queue run_name, optimizer, max_steps from (").count(), 4);
        assert!(file.contains(
            "batch_size = 64\nqueue run_name, optimizer, max_steps from (\n  sgd_bs64_base, sgd, 350\n  adam_bs64_base, adam, 250\n  rms_bs64_base, rms, 350\n)\n"
        ));
        assert!(file.contains(
            "arguments    = \"$(run_name) --num-processes $(workers) --log-interval 200 \
             --checkpoint-name $(run_name) --resume -1 --checkpoint-lname /shared/checkpoints/base.ckpt \
             --lr 0.1 --batch-size $(batch_size) --tmp-dir /scratch --final-dir /shared/outputs \
             --attack-checkpoint-path attack --max-steps $(max_steps) --optimizer $(optimizer) baseline\"\n"
        ));
    }

    #[test]
    fn run_names_must_fit_queue_items() {
        let mut config = config();
        config.sweep.run_name = RunNameTemplate::parse("{optimizer}, {batch_size}").unwrap();
        let descriptors = config.descriptors().unwrap();

        assert!(matches!(
            render(&config, &descriptors),
            Err(SweepError::InvalidRunName(_))
        ));
    }

    #[test]
    fn quoting() {
        assert_eq!(condor_quote("--lr"), "--lr");
        assert_eq!(condor_quote("a b"), "'a b'");
        assert_eq!(condor_quote("it's"), "'it''s'");
    }
}
