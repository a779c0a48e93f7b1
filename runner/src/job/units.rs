//! Work units shipped with the `jobcluster` binary

use super::{display_value, JobDescriptor, JobError, Registry, WorkUnit, WorkUnitType};
use crate::task::{TaskContext, TaskError};
use itertools::Itertools;
use std::{
    fs::OpenOptions,
    io::Write,
    path::PathBuf,
    process::Command,
};
use tracing::debug;

/// registry containing every built-in work unit
pub fn builtin_registry() -> Registry {
    Registry::new().with::<Echo>().with::<Exec>()
}

/// Print all arguments, optionally appending the same line to `append_to`
#[derive(Debug, Clone, PartialEq)]
pub struct Echo {
    pub line: String,
    pub append_to: Option<PathBuf>,
}

impl WorkUnitType for Echo {
    const NAME: &'static str = "echo";

    fn from_job(job: &JobDescriptor) -> Result<Self, JobError> {
        let args = job.args().iter().map(display_value);
        let kwargs = job
            .kwargs()
            .iter()
            .filter(|(name, _)| name.as_str() != "append_to")
            .map(|(name, value)| format!("{name}={}", display_value(value)));

        Ok(Self {
            line: args.chain(kwargs).join(" "),
            append_to: job.kwarg("append_to")?,
        })
    }
}

impl WorkUnit for Echo {
    fn run(&self, _context: &TaskContext) -> Result<(), TaskError> {
        println!("{}", self.line);

        if let Some(path) = &self.append_to {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(file, "{}", self.line)?;
        }

        Ok(())
    }
}

/// Run an external program: the first positional argument is the program, the rest are passed on
///
/// With `creates` set the job is skipped on resubmission once that path exists.
#[derive(Debug, Clone, PartialEq)]
pub struct Exec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub creates: Option<PathBuf>,
}

impl WorkUnitType for Exec {
    const NAME: &'static str = "exec";

    fn from_job(job: &JobDescriptor) -> Result<Self, JobError> {
        Ok(Self {
            program: job.arg(0)?,
            args: job.args().iter().skip(1).map(display_value).collect(),
            creates: job.kwarg("creates")?,
        })
    }
}

impl WorkUnit for Exec {
    fn run(&self, context: &TaskContext) -> Result<(), TaskError> {
        debug!(program = ?self.program, args = ?self.args, task = context.index, "Spawning program");

        let status = Command::new(&self.program).args(&self.args).status()?;

        if status.success() {
            Ok(())
        } else {
            Err(TaskError::Failed(format!(
                "{} exited with {status}",
                self.program.display()
            )))
        }
    }

    fn should_run(&self) -> bool {
        self.creates.as_ref().map_or(true, |path| !path.exists())
    }
}
