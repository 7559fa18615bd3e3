use super::{slurm::parse_job_id, Executors, LaunchError, Launched};
use crate::{config::ExecutorConfig, invoker::Invocation, resources::ResourceRequest};
use std::{
    collections::BTreeMap,
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use tempfile::TempDir;

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

    path
}

fn invocation(program: PathBuf, output: PathBuf) -> Invocation {
    Invocation {
        run_name: "adam_bs64_base".to_owned(),
        program,
        args: vec![
            "adam_bs64_base".to_owned(),
            "--optimizer".to_owned(),
            "adam".to_owned(),
            "baseline".to_owned(),
        ],
        resources: ResourceRequest { cores: 9, gpus: 1 },
        output,
    }
}

fn executor(name: &str, parameter: Option<&str>) -> Executors {
    Executors::load(&ExecutorConfig {
        name: name.to_owned(),
        parameter: parameter.map(|yaml| serde_yaml::from_str::<BTreeMap<_, _>>(yaml).unwrap()),
    })
    .unwrap()
}

fn wait_for_content(path: &Path) -> String {
    for _ in 0..100 {
        if let Ok(content) = fs::read_to_string(path) {
            if !content.is_empty() {
                return content;
            }
        }
        thread::sleep(Duration::from_millis(50));
    }

    panic!("{} stayed empty", path.display());
}

#[test]
pub fn unknown_executor() {
    let result = Executors::load(&ExecutorConfig {
        name: "condor".to_owned(),
        parameter: None,
    });

    assert!(result.is_err());
}

#[test]
pub fn dry_run_leaves_state_alone() {
    let dir = TempDir::new().unwrap();
    let program = script(dir.path(), "main.py", "exit 0");
    let output = dir.path().join("adam_bs64_base.out");

    let mut executor = executor("dry-run", None);
    assert!(!executor.touches_state());
    assert_eq!(
        executor.launch(&invocation(program, output.clone())).unwrap(),
        Launched::Planned
    );
    assert!(!output.exists());
}

#[test]
pub fn missing_program_is_a_launch_error() {
    let dir = TempDir::new().unwrap();
    let mut executor = executor("local", None);

    let error = executor
        .launch(&invocation(dir.path().join("nope.py"), dir.path().join("x.out")))
        .unwrap_err();

    assert!(matches!(error, LaunchError::ProgramNotFound(_)));
}

#[test]
pub fn non_executable_program_is_a_launch_error() {
    let dir = TempDir::new().unwrap();
    let program = dir.path().join("main.py");
    fs::write(&program, "print('hi')").unwrap();
    fs::set_permissions(&program, fs::Permissions::from_mode(0o644)).unwrap();

    let error = executor("slurm", None)
        .launch(&invocation(program, dir.path().join("x.out")))
        .unwrap_err();

    assert!(matches!(error, LaunchError::NotExecutable(_)));
}

#[test]
pub fn local_launch_passes_arguments_and_env() {
    let dir = TempDir::new().unwrap();
    let program = script(dir.path(), "main.py", r#"echo "$OMP_NUM_THREADS $@""#);
    let output = dir.path().join("adam_bs64_base.out");

    let mut executor = executor("local", Some("env: { OMP_NUM_THREADS: 2 }"));
    let launched = executor
        .launch(&invocation(program, output.clone()))
        .unwrap();

    assert!(matches!(launched, Launched::Process { .. }));
    assert_eq!(
        wait_for_content(&output).trim(),
        "2 adam_bs64_base --optimizer adam baseline"
    );
}

#[test]
pub fn local_env_must_be_scalar() {
    let result = Executors::load(&ExecutorConfig {
        name: "local".to_owned(),
        parameter: Some(serde_yaml::from_str("env: { PATHS: [a, b] }").unwrap()),
    });

    assert!(result.is_err());
}

#[test]
pub fn slurm_submission() {
    let dir = TempDir::new().unwrap();
    let program = script(dir.path(), "main.py", "exit 0");
    let recorded = dir.path().join("sbatch.args");
    let sbatch = script(
        dir.path(),
        "sbatch",
        &format!(
            r#"printf '%s\n' "$@" >> {}
echo "4242;cluster""#,
            recorded.display()
        ),
    );

    let mut executor = executor(
        "slurm",
        Some(&format!(
            "{{ sbatch: {}, partition: gpu, extra: [--mem=16G] }}",
            sbatch.display()
        )),
    );
    let output = dir.path().join("adam_bs64_base.out");
    let launched = executor
        .launch(&invocation(program.clone(), output.clone()))
        .unwrap();

    assert_eq!(launched, Launched::Submitted { job_id: 4242 });

    let arguments = fs::read_to_string(&recorded).unwrap();
    let arguments: Vec<&str> = arguments.lines().collect();
    assert_eq!(
        arguments,
        vec![
            "--parsable".to_owned(),
            "--job-name=adam_bs64_base".to_owned(),
            "--cpus-per-task=9".to_owned(),
            "--gres=gpu:1".to_owned(),
            format!("--output={}", output.display()),
            "--partition=gpu".to_owned(),
            "--mem=16G".to_owned(),
            format!(
                "--wrap={} adam_bs64_base --optimizer adam baseline",
                program.display()
            ),
        ]
    );
}

#[test]
pub fn slurm_rejection() {
    let dir = TempDir::new().unwrap();
    let program = script(dir.path(), "main.py", "exit 0");
    let sbatch = script(
        dir.path(),
        "sbatch",
        "echo 'sbatch: error: invalid partition' >&2\nexit 1",
    );

    let mut executor = executor("slurm", Some(&format!("sbatch: {}", sbatch.display())));
    let error = executor
        .launch(&invocation(program, dir.path().join("x.out")))
        .unwrap_err();

    match error {
        LaunchError::Rejected { stderr, .. } => {
            assert_eq!(stderr, "sbatch: error: invalid partition")
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
pub fn job_id_parsing() {
    assert_eq!(parse_job_id("4242\n").unwrap(), 4242);
    assert_eq!(parse_job_id("17;cluster\n").unwrap(), 17);
    assert_eq!(parse_job_id("Submitted batch job 99\n").unwrap(), 99);
    assert!(matches!(
        parse_job_id("\n"),
        Err(LaunchError::UnexpectedResponse(_))
    ));
    assert!(parse_job_id("sbatch: queued").is_err());
}
