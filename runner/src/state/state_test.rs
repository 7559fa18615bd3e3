use super::{RunStateStore, ScratchStore};
use std::{fs, os::unix::fs::symlink};
use tempfile::TempDir;

fn stale_run(root: &TempDir, name: &str) {
    let root = root.path();

    fs::write(root.join(format!("{name}.status")), "Starting Training").unwrap();
    fs::create_dir_all(root.join(format!("{name}.hogwild/nested"))).unwrap();
    fs::write(root.join(format!("{name}.hogwild/nested/eval")), "0,0.1\n").unwrap();
    fs::write(root.join(format!("{name}.bias")), "0.2 0.3 0.5").unwrap();
    fs::write(root.join(format!("{name}.out")), "old output").unwrap();
}

#[test]
pub fn paths_are_keyed_by_run_name() {
    let store = ScratchStore::new("/scratch");
    let paths = store.paths_for("adam_bs64_base");

    assert_eq!(paths.status.to_str(), Some("/scratch/adam_bs64_base.status"));
    assert_eq!(paths.workdir.to_str(), Some("/scratch/adam_bs64_base.hogwild"));
    assert_eq!(paths.bias.to_str(), Some("/scratch/adam_bs64_base.bias"));
    assert_eq!(paths.output.to_str(), Some("/scratch/adam_bs64_base.out"));
}

#[test]
pub fn reset_removes_stale_state() {
    let root = TempDir::new().unwrap();
    stale_run(&root, "adam_bs64_base");

    let store = ScratchStore::new(root.path());
    let paths = store.reset("adam_bs64_base").unwrap();

    assert!(!paths.status.exists());
    assert!(!paths.workdir.exists());
    assert!(!paths.output.exists());
    assert!(paths.bias.is_file());
    assert_eq!(fs::metadata(&paths.bias).unwrap().len(), 0);
}

#[test]
pub fn reset_is_idempotent() {
    let root = TempDir::new().unwrap();
    let store = ScratchStore::new(root.path());

    // nothing exists yet
    let first = store.reset("sgd_bs128_base").unwrap();
    let second = store.reset("sgd_bs128_base").unwrap();

    assert_eq!(first, second);
    assert!(!second.status.exists());
    assert!(!second.workdir.exists());
    assert_eq!(fs::read(&second.bias).unwrap(), Vec::<u8>::new());
}

#[test]
pub fn reset_leaves_other_runs_alone() {
    let root = TempDir::new().unwrap();
    stale_run(&root, "adam_bs64_base");
    stale_run(&root, "adam_bs32_base");

    ScratchStore::new(root.path())
        .reset("adam_bs64_base")
        .unwrap();

    assert!(root.path().join("adam_bs32_base.status").is_file());
    assert!(root.path().join("adam_bs32_base.hogwild/nested/eval").is_file());
    assert_eq!(
        fs::read_to_string(root.path().join("adam_bs32_base.bias")).unwrap(),
        "0.2 0.3 0.5"
    );
}

#[test]
pub fn reset_handles_half_written_state() {
    let root = TempDir::new().unwrap();
    // a crashed run may leave a file where the directory belongs and vice versa
    fs::write(root.path().join("rms_bs16_base.hogwild"), "partial").unwrap();
    fs::create_dir(root.path().join("rms_bs16_base.bias")).unwrap();
    fs::create_dir(root.path().join("rms_bs16_base.status")).unwrap();

    let paths = ScratchStore::new(root.path()).reset("rms_bs16_base").unwrap();

    assert!(!paths.workdir.exists());
    assert!(!paths.status.exists());
    assert!(paths.bias.is_file());
}

#[test]
pub fn bias_symlink_is_replaced_not_followed() {
    let root = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    let dangling = outside.path().join("elsewhere.bias");
    let target = outside.path().join("kept.bias");
    fs::write(&target, "0.2 0.3 0.5").unwrap();

    symlink(&dangling, root.path().join("sgd_bs32_base.bias")).unwrap();
    symlink(&target, root.path().join("adam_bs32_base.bias")).unwrap();

    let store = ScratchStore::new(root.path());
    let sgd = store.reset("sgd_bs32_base").unwrap();
    let adam = store.reset("adam_bs32_base").unwrap();

    assert!(!dangling.exists());
    assert_eq!(fs::read_to_string(&target).unwrap(), "0.2 0.3 0.5");
    for paths in [sgd, adam] {
        let metadata = fs::symlink_metadata(&paths.bias).unwrap();
        assert!(metadata.is_file());
        assert_eq!(metadata.len(), 0);
    }
}

#[test]
pub fn missing_scratch_root_is_systemic() {
    let root = TempDir::new().unwrap();
    let store = ScratchStore::new(root.path().join("not-mounted"));

    assert!(!store.is_reachable());

    let error = store.reset("sgd_bs16_base").unwrap_err();
    assert!(error.systemic);
    assert_eq!(error.run_name, "sgd_bs16_base");
    assert!(error.to_string().contains("sgd_bs16_base"));
}
