use crate::{
    config::ClusterConfig,
    job::{units::builtin_registry, JobDescriptor, JobError, Registry, WorkUnit, WorkUnitType},
    task::{TaskContext, TaskError},
};
use std::{path::Path, path::PathBuf, sync::Arc};

/// does nothing, skipped before submission when `skip` is true
pub struct Noop {
    skip: bool,
}

impl WorkUnitType for Noop {
    const NAME: &'static str = "noop";

    fn from_job(job: &JobDescriptor) -> Result<Self, JobError> {
        Ok(Self {
            skip: job.kwarg("skip")?.unwrap_or(false),
        })
    }
}

impl WorkUnit for Noop {
    fn run(&self, _context: &TaskContext) -> Result<(), TaskError> {
        Ok(())
    }

    fn should_run(&self) -> bool {
        !self.skip
    }
}

pub fn registry() -> Arc<Registry> {
    Arc::new(builtin_registry().with::<Noop>())
}

/// configuration rooted in `dir`, neither copying the task binary nor reaching a real scheduler
pub fn config(dir: &Path) -> ClusterConfig {
    ClusterConfig {
        jobs_dir: dir.join("jobs"),
        working_directory: Some(dir.to_path_buf()),
        task_binary: Some(PathBuf::from("/bin/true")),
        copy_task_binary: false,
        submit_command: PathBuf::from("/bin/echo"),
        ..Default::default()
    }
}
