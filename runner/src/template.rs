use crate::{config::Settings, round::RoundHandle};
use handlebars::Handlebars;
use itertools::Itertools;
use serde::Serialize;
use std::{
    fs::{self, Permissions},
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

pub const RUNNER_TEMPLATE: &str = "runner";
pub const SUBMIT_TEMPLATE: &str = "submit";

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Failed to compile template")]
    Compile(#[from] handlebars::TemplateError),
    #[error("Failed to render template")]
    Render(#[from] handlebars::RenderError),
    #[error("Failed to write rendered script")]
    Io(#[from] io::Error),
}

/// Values shared by the runner and the submission script of one round
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct TemplateContext {
    // fresh per round, ends up in the job comment for tracing a job back to its round
    pub uuid: String,
    pub round_dir: PathBuf,
    pub jobs_dir: PathBuf,
    pub log_dir: PathBuf,
    pub runner_path: PathBuf,
    pub working_directory: PathBuf,
    pub append_to_path: Vec<PathBuf>,
    pub task_binary: PathBuf,
    // command line the scheduler runs for every array task, already shell quoted
    pub executable: String,
    pub arguments: String,
    pub required_bytes: u64,
    pub required_mem: u64,
    pub request_cpus: u32,
    pub request_time: u64,
    pub qos: Option<String>,
    pub exclude_nodes: Option<String>,
    pub export: String,
    pub extra_slurm_args: Vec<String>,
    pub n_jobs: usize,
    pub quoted: QuotedPaths,
}

/// Paths as they appear in shell commands of the runner script
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct QuotedPaths {
    pub round_dir: String,
    pub working_directory: String,
    pub append_to_path: Vec<String>,
    pub task_binary: String,
}

impl QuotedPaths {
    fn new(
        round_dir: &Path,
        working_directory: &Path,
        append_to_path: &[PathBuf],
        task_binary: &Path,
    ) -> Self {
        let quote = |path: &Path| shell_quote(&path.to_string_lossy());

        Self {
            round_dir: quote(round_dir),
            working_directory: quote(working_directory),
            append_to_path: append_to_path.iter().map(|path| quote(path)).collect(),
            task_binary: quote(task_binary),
        }
    }
}

impl TemplateContext {
    pub fn new(
        settings: &Settings,
        round: &RoundHandle,
        task_binary: PathBuf,
        executable: &Path,
        arguments: &[String],
        n_jobs: usize,
    ) -> Self {
        let quoted = QuotedPaths::new(
            round.path(),
            &settings.working_directory,
            &settings.append_to_path,
            &task_binary,
        );

        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            round_dir: round.path().to_path_buf(),
            jobs_dir: round.jobs_dir(),
            log_dir: round.log_dir(),
            runner_path: round.runner_path(),
            working_directory: settings.working_directory.clone(),
            append_to_path: settings.append_to_path.clone(),
            task_binary,
            executable: shell_quote(&executable.to_string_lossy()),
            arguments: arguments.iter().map(|argument| shell_quote(argument)).join(" "),
            required_bytes: settings.required_memory,
            required_mem: settings.required_megabytes(),
            request_cpus: settings.request_cpus,
            request_time: settings.request_time,
            qos: settings.qos.clone(),
            exclude_nodes: Some(settings.exclude_nodes.join(","))
                .filter(|nodes| !nodes.is_empty()),
            export: settings.export.clone(),
            extra_slurm_args: settings.extra_slurm_args.clone(),
            n_jobs,
            quoted,
        }
    }
}

/// quote `value` for sh unless it only contains characters that need no quoting
pub fn shell_quote(value: &str) -> String {
    let is_safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c));

    if is_safe {
        value.to_owned()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Renders the runner and submission scripts
#[derive(Debug)]
pub struct Renderer {
    registry: Handlebars<'static>,
}

impl Renderer {
    pub fn new() -> Result<Self, TemplateError> {
        let mut registry = Handlebars::new();
        // output is shell, not HTML
        registry.register_escape_fn(handlebars::no_escape);
        registry.register_template_string(
            RUNNER_TEMPLATE,
            include_str!("../templates/runner.sh.hbs"),
        )?;
        registry.register_template_string(
            SUBMIT_TEMPLATE,
            include_str!("../templates/submit.sh.hbs"),
        )?;

        Ok(Self { registry })
    }

    pub fn render(&self, name: &str, context: &TemplateContext) -> Result<String, TemplateError> {
        Ok(self.registry.render(name, context)?)
    }

    /// render `name` into an executable file at `path`
    pub fn write(
        &self,
        name: &str,
        context: &TemplateContext,
        path: &Path,
    ) -> Result<(), TemplateError> {
        fs::write(path, self.render(name, context)?)?;
        fs::set_permissions(path, Permissions::from_mode(0o755))?;

        debug!(template = name, path = ?path, "Rendered script");

        Ok(())
    }
}
