//! Kept apart from the other local runs: the freshly copied binary is executed right away, which
//! must not race with forks from tests running in parallel threads.

use jobcluster::{
    cluster::RoundStatus, job::units::builtin_registry, Arg, ClusterConfig, JobCluster, JobSpec,
};
use std::{fs, path::PathBuf, sync::Arc};

#[test]
fn copied_task_binary_runs_the_round() {
    let dir = tempfile::tempdir().unwrap();
    let config = ClusterConfig {
        jobs_dir: dir.path().join("jobs"),
        working_directory: Some(dir.path().to_path_buf()),
        task_binary: Some(PathBuf::from(env!("CARGO_BIN_EXE_jobcluster"))),
        copy_task_binary: true,
        max_jobs_per_round: 2,
        ..Default::default()
    };
    let mut cluster = JobCluster::new(&config, Arc::new(builtin_registry())).unwrap();

    cluster
        .add_job(&JobSpec::new("echo").arg(Arg::permute(["a", "b", "c"])))
        .unwrap();

    let outcomes = cluster.run_local().unwrap();

    assert_eq!(outcomes.len(), 2);
    for outcome in outcomes.iter() {
        assert_eq!(outcome.status, RoundStatus::Local { failed: vec![] });
        assert!(outcome.round.support_dir().join("jobcluster").is_file());
    }

    let log = fs::read_to_string(outcomes[1].round.log_path(1)).unwrap();
    assert!(log.contains("Now running echo(\"c\")"), "{log}");
}
