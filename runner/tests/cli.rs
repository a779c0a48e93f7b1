use std::{
    fs,
    path::Path,
    process::{Command, Output},
};

fn jobcluster(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_jobcluster"))
        .args(args)
        .current_dir(dir)
        .env_remove("SLURM_ARRAY_TASK_ID")
        .env_remove("SLURM_ARRAY_JOB_ID")
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn write_sweep(dir: &Path, contents: &str) {
    fs::write(dir.join("sweep.yaml"), contents).unwrap();
}

const ECHO_SWEEP: &str = r#"
cluster:
  submit_command: /bin/echo
jobs:
  - unit: echo
    args: [{permute: [1, 2, 3]}]
"#;

#[test]
fn dry_run_then_show() {
    let dir = tempfile::tempdir().unwrap();
    write_sweep(dir.path(), ECHO_SWEEP);

    let output = jobcluster(dir.path(), &["submit", "sweep.yaml", "--dry-run"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("3 jobs written, not submitted"));

    let round = dir.path().join("jobs").join("001");
    let script = fs::read_to_string(round.join("submit.sh")).unwrap();
    assert!(script.contains("#SBATCH --array=1-3"));
    assert!(round.join("runner.sh").is_file());
    assert!(round.join("bin").join("jobcluster").is_file());

    let output = jobcluster(dir.path(), &["show", "jobs/001"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(stdout(&output), "   1: echo(1)\n   2: echo(2)\n   3: echo(3)\n");

    let output = jobcluster(dir.path(), &["show", "jobs/001", "--index", "2"]);
    assert_eq!(stdout(&output), "   2: echo(2)\n");
}

#[test]
fn submit_reports_scheduler_output() {
    let dir = tempfile::tempdir().unwrap();
    write_sweep(dir.path(), ECHO_SWEEP);

    let output = jobcluster(dir.path(), &["submit", "sweep.yaml"]);
    let out = stdout(&output);

    assert!(output.status.success(), "{}", stderr(&output));
    assert!(out.contains("Submit output:"), "{out}");
    assert!(out.contains("Submitted 3/3 jobs."), "{out}");
    assert!(out.contains("3 jobs submitted"), "{out}");
}

#[test]
fn task_runs_a_single_index() {
    let dir = tempfile::tempdir().unwrap();
    write_sweep(dir.path(), ECHO_SWEEP);
    assert!(jobcluster(dir.path(), &["submit", "sweep.yaml", "--dry-run"])
        .status
        .success());

    let output = jobcluster(dir.path(), &["task", "--round", "jobs/001", "--index", "2"]);
    let out = stdout(&output);

    assert!(output.status.success(), "{}", stderr(&output));
    assert!(out.contains("Now running echo(2)"), "{out}");
    assert!(out.contains("Job ID: 0, Task ID: 2"), "{out}");
}

#[test]
fn task_needs_an_index() {
    let dir = tempfile::tempdir().unwrap();

    let output = jobcluster(dir.path(), &["task", "--round", "jobs/001"]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("SLURM_ARRAY_TASK_ID"));
}

#[test]
fn run_local_reports_failed_tasks() {
    let dir = tempfile::tempdir().unwrap();
    write_sweep(
        dir.path(),
        r#"
jobs:
  - unit: exec
    args: [{permute: [/bin/true, /bin/false]}]
"#,
    );

    let output = jobcluster(dir.path(), &["run-local", "sweep.yaml"]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("1 of 2 local tasks failed"), "{}", stderr(&output));
    assert!(dir.path().join("jobs/001/log/out_1.log").is_file());
    assert!(dir.path().join("jobs/001/log/out_2.log").is_file());
}

#[test]
fn unknown_work_unit_fails_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    write_sweep(dir.path(), "jobs:\n  - unit: missing\n");

    let output = jobcluster(dir.path(), &["submit", "sweep.yaml", "--dry-run"]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("`missing` is not registered"));
    assert!(!dir.path().join("jobs").exists());
}
