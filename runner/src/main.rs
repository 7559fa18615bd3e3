use clap::{Parser, Subcommand, ValueEnum};
use hogsweep_runner::{
    config::{ConfigErrors, SweepConfig},
    executors::Executors,
    invoker::{Invocation, Invoker},
    state::{RunStateStore, ScratchStore},
    submit,
    sweep::{JobDescriptor, Optimizer},
};
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

/// Expand parameter sweeps of a hogwild training program and launch them
#[derive(Parser, Debug)]
#[command(name = "hogsweep", author, version, about)]
struct Cli {
    /// Log level (trace, debug, info, warn, error), RUST_LOG takes precedence
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the expanded jobs in launch order, nothing is touched
    Plan {
        config: PathBuf,

        #[arg(long, value_enum, default_value_t = Format::Table)]
        format: Format,
    },

    /// Reset run state and launch every job of the sweep
    Launch {
        config: PathBuf,

        /// Only report what would be launched
        #[arg(long)]
        dry_run: bool,

        /// Restrict the sweep to these runs, may be repeated
        #[arg(long, value_name = "RUN_NAME")]
        only: Vec<String>,
    },

    /// Reset the run state of the named runs without launching them
    Reset {
        config: PathBuf,

        #[arg(required = true)]
        run_names: Vec<String>,
    },

    /// Print a scheduler submission file covering the sweep
    SubmitFile { config: PathBuf },

    /// Print the full command line of a single run
    Args { config: PathBuf, run_name: String },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Format {
    Table,
    Yaml,
}

#[derive(Serialize)]
struct PlanRow<'a> {
    run_name: &'a str,
    batch_size: u32,
    optimizer: Optimizer,
    max_steps: u32,
    workers: u32,
    cores: u32,
    gpus: u32,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli.command) {
        Ok(code) => code,
        Err(error) => {
            error!("{error}");

            ExitCode::from(2)
        }
    }
}

fn run(command: Command) -> Result<ExitCode, ConfigErrors> {
    match command {
        Command::Plan { config, format } => {
            let (config, descriptors) = load(&config)?;
            plan(&config, &descriptors, format);

            Ok(ExitCode::SUCCESS)
        }
        Command::Launch {
            config,
            dry_run,
            only,
        } => {
            let (mut config, descriptors) = load(&config)?;
            let descriptors = select(descriptors, &only)?;

            if dry_run {
                config.executor.name = "dry-run".to_owned();
            }

            let executor = Executors::load(&config.executor)?;

            if config.preflight_checks(executor.touches_state()) {
                return Err(ConfigErrors::Preflight);
            }

            let store = ScratchStore::new(&config.paths.scratch_root);
            let report = Invoker::new(&config, store, executor).run(&descriptors);

            for (run_name, launched) in report.launched.iter() {
                println!("{run_name}\t{launched}");
            }

            Ok(exit_code(report.is_success()))
        }
        Command::Reset { config, run_names } => {
            let (config, descriptors) = load(&config)?;
            let descriptors = select(descriptors, &run_names)?;
            let store = ScratchStore::new(&config.paths.scratch_root);
            let mut success = true;

            for descriptor in descriptors.iter() {
                if let Err(error) = store.reset(&descriptor.run_name) {
                    error!(run_name = %descriptor.run_name, "{error}");
                    success = false;

                    if error.systemic {
                        warn!("Scratch area is unusable, skipping the remaining runs");
                        break;
                    }
                }
            }

            Ok(exit_code(success))
        }
        Command::SubmitFile { config } => {
            let (config, descriptors) = load(&config)?;
            print!("{}", submit::render(&config, &descriptors)?);

            Ok(ExitCode::SUCCESS)
        }
        Command::Args { config, run_name } => {
            let (config, descriptors) = load(&config)?;
            let store = ScratchStore::new(&config.paths.scratch_root);

            for descriptor in select(descriptors, &[run_name])? {
                let output = store.paths_for(&descriptor.run_name).output;
                println!(
                    "{}",
                    Invocation::new(&config, &descriptor, output).command_line()
                );
            }

            Ok(ExitCode::SUCCESS)
        }
    }
}

/// load the config and expand it, any configuration error aborts here
fn load(path: &Path) -> Result<(SweepConfig, Vec<JobDescriptor>), ConfigErrors> {
    let config = SweepConfig::load(path)?;
    let descriptors = config.descriptors()?;

    Ok((config, descriptors))
}

/// keep only the named runs, an empty selection keeps everything
fn select(
    descriptors: Vec<JobDescriptor>,
    run_names: &[String],
) -> Result<Vec<JobDescriptor>, ConfigErrors> {
    if run_names.is_empty() {
        return Ok(descriptors);
    }

    if let Some(unknown) = run_names
        .iter()
        .find(|name| !descriptors.iter().any(|job| &job.run_name == *name))
    {
        return Err(ConfigErrors::UnknownRun(unknown.clone()));
    }

    Ok(descriptors
        .into_iter()
        .filter(|job| run_names.contains(&job.run_name))
        .collect())
}

fn plan(config: &SweepConfig, descriptors: &[JobDescriptor], format: Format) {
    let rows: Vec<PlanRow> = descriptors
        .iter()
        .map(|job| {
            let resources = config.resources.request(job.workers);

            PlanRow {
                run_name: &job.run_name,
                batch_size: job.batch_size,
                optimizer: job.optimizer,
                max_steps: job.max_steps,
                workers: job.workers,
                cores: resources.cores,
                gpus: resources.gpus,
            }
        })
        .collect();

    match format {
        Format::Yaml => print!("{}", serde_yaml::to_string(&rows).unwrap_or_log()),
        Format::Table => {
            let width = rows.iter().map(|row| row.run_name.len()).max().unwrap_or(0);

            println!(
                "{:<width$}  {:>10}  {:<9}  {:>9}  {:>7}  {:>5}  {:>4}",
                "run", "batch_size", "optimizer", "max_steps", "workers", "cores", "gpus"
            );
            for row in rows.iter() {
                println!(
                    "{:<width$}  {:>10}  {:<9}  {:>9}  {:>7}  {:>5}  {:>4}",
                    row.run_name,
                    row.batch_size,
                    row.optimizer.as_str(),
                    row.max_steps,
                    row.workers,
                    row.cores,
                    row.gpus
                );
            }
        }
    }
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
