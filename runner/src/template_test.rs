use crate::{
    config::Memory,
    round::prepare_round,
    template::{shell_quote, Renderer, TemplateContext, RUNNER_TEMPLATE, SUBMIT_TEMPLATE},
    test_util,
};
use std::{fs, os::unix::fs::PermissionsExt, path::Path};

#[test]
fn quoting() {
    assert_eq!(shell_quote("plain-path/x.sh"), "plain-path/x.sh");
    assert_eq!(shell_quote("with space"), "'with space'");
    assert_eq!(shell_quote("it's"), r"'it'\''s'");
    assert_eq!(shell_quote(""), "''");
    assert_eq!(shell_quote("$HOME"), "'$HOME'");
}

#[test]
fn submission_script_directives() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_util::config(dir.path());
    config.required_memory = Memory::Bytes(512 * 1024 * 1024);
    config.request_cpus = 4;
    config.request_time = 90;
    config.qos = Some("short".to_owned());
    config.exclude_nodes = vec!["node1".to_owned(), "node2".to_owned()];
    config.extra_slurm_args = vec!["--partition=cpu".to_owned()];
    let settings = config.preflight_checks().unwrap();

    let round = prepare_round(&settings.jobs_dir, true).unwrap();
    let context = TemplateContext::new(
        &settings,
        &round,
        settings.task_binary.clone(),
        Path::new("/bin/sh"),
        &[round.runner_path().to_string_lossy().into_owned()],
        7,
    );
    let script = Renderer::new().unwrap().render(SUBMIT_TEMPLATE, &context).unwrap();

    for directive in [
        "#SBATCH --array=1-7".to_owned(),
        "#SBATCH --mem=512M".to_owned(),
        "#SBATCH --cpus-per-task=4".to_owned(),
        "#SBATCH --time=90".to_owned(),
        "#SBATCH --qos=short".to_owned(),
        "#SBATCH --exclude=node1,node2".to_owned(),
        "#SBATCH --partition=cpu".to_owned(),
        "#SBATCH --export=NONE".to_owned(),
        format!("#SBATCH --comment={}", context.uuid),
        format!("#SBATCH --output={}/out_%a.log", round.log_dir().display()),
    ] {
        assert!(script.contains(&directive), "missing {directive} in\n{script}");
    }

    assert!(script.starts_with("#!/bin/sh\n"));
    assert_eq!(
        script.trim_end().lines().last(),
        Some(format!("/bin/sh {}", shell_quote(&round.runner_path().to_string_lossy())).as_str())
    );
}

#[test]
fn optional_directives_are_omitted() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_util::config(dir.path()).preflight_checks().unwrap();
    let round = prepare_round(&settings.jobs_dir, true).unwrap();

    let context = TemplateContext::new(&settings, &round, "/bin/true".into(), Path::new("/bin/sh"), &[], 1);
    let script = Renderer::new().unwrap().render(SUBMIT_TEMPLATE, &context).unwrap();

    assert!(!script.contains("--qos"));
    assert!(!script.contains("--exclude"));
    assert_eq!(context.exclude_nodes, None);
}

#[test]
fn runner_script_enters_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_util::config(dir.path());
    config.required_memory = Memory::Bytes(1000);
    config.append_to_path = vec!["/opt/tools/bin".into()];
    let settings = config.preflight_checks().unwrap();
    let round = prepare_round(&settings.jobs_dir, true).unwrap();

    let context = TemplateContext::new(&settings, &round, "/bin/true".into(), Path::new("/bin/sh"), &[], 1);
    let script = Renderer::new().unwrap().render(RUNNER_TEMPLATE, &context).unwrap();

    assert!(script.contains(&format!("cd {} || exit 1", settings.working_directory.display())));
    assert!(script.contains("PATH=\"$PATH\":/opt/tools/bin"));
    assert!(script.contains(&format!(
        "exec /bin/true task --round {} --requested-memory 1000",
        round.path().display()
    )));
}

#[test]
fn runner_script_quotes_paths() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().join("run$HOME\"`id`");
    fs::create_dir(&workdir).unwrap();
    let mut config = test_util::config(&workdir);
    config.append_to_path = vec!["/opt/$tools".into()];
    let settings = config.preflight_checks().unwrap();
    let round = prepare_round(&settings.jobs_dir, true).unwrap();

    let context = TemplateContext::new(&settings, &round, "/bin/true".into(), Path::new("/bin/sh"), &[], 1);
    let script = Renderer::new().unwrap().render(RUNNER_TEMPLATE, &context).unwrap();

    assert!(script.contains(&format!("cd '{}' || exit 1", settings.working_directory.display())));
    assert!(script.contains("PATH=\"$PATH\":'/opt/$tools'"));
    assert!(script.contains(&format!("--round '{}' ", round.path().display())));
}

#[test]
fn written_scripts_are_executable() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_util::config(dir.path()).preflight_checks().unwrap();
    let round = prepare_round(&settings.jobs_dir, true).unwrap();
    let context = TemplateContext::new(&settings, &round, "/bin/true".into(), Path::new("/bin/sh"), &[], 1);

    Renderer::new()
        .unwrap()
        .write(RUNNER_TEMPLATE, &context, &round.runner_path())
        .unwrap();

    let mode = fs::metadata(round.runner_path()).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
}
