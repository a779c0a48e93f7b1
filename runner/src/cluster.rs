pub mod container;


use crate::{
    config::{ClusterConfig, ConfigErrors, Settings},
    expand::JobSpec,
    job::{JobDescriptor, JobError, Registry},
    round::{prepare_round, RoundError, RoundHandle},
    task::{JOB_ID_VARIABLE, TASK_ID_VARIABLE},
    template::{Renderer, TemplateContext, TemplateError, RUNNER_TEMPLATE, SUBMIT_TEMPLATE},
};
use container::Container;
use parking_lot::FairMutex;
use std::{
    collections::VecDeque,
    fs::File,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigErrors),
    #[error("Work unit `{0}` is not registered")]
    InvalidWorkUnit(String),
    #[error(transparent)]
    Job(JobError),
    #[error(transparent)]
    Round(#[from] RoundError),
    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl From<JobError> for ClusterError {
    fn from(error: JobError) -> Self {
        match error {
            JobError::InvalidWorkUnit(name) => Self::InvalidWorkUnit(name),
            other => Self::Job(other),
        }
    }
}

/// How the scheduler starts the runner script of a task
#[derive(Debug, Clone)]
pub enum Launcher {
    /// `<interpreter> <runner>`
    Direct,
    /// `<runtime> exec -B .. <args> <image> <interpreter> <runner>`
    Container(Container),
}

impl Launcher {
    /// executable and arguments that run `runner` with `interpreter`
    pub fn command(&self, interpreter: &Path, runner: &Path) -> (PathBuf, Vec<String>) {
        match self {
            Self::Direct => (
                interpreter.to_path_buf(),
                vec![runner.to_string_lossy().into_owned()],
            ),
            Self::Container(container) => (
                container.runtime().to_path_buf(),
                container.arguments(interpreter, runner),
            ),
        }
    }
}

/// What happened to one round
#[derive(Debug, Clone, PartialEq)]
pub enum RoundStatus {
    /// artifacts written, scheduler not invoked
    DryRun,
    /// scheduler accepted the submission script
    Submitted { output: String },
    /// scheduler failed or could not be started, subsequent rounds continue regardless
    SubmitFailed { output: String },
    /// tasks ran locally, `failed` holds the indices of tasks that did not succeed
    Local { failed: Vec<usize> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoundOutcome {
    pub round: RoundHandle,
    pub jobs: usize,
    pub status: RoundStatus,
}

/// A round whose files are on disk
struct Materialized {
    round: RoundHandle,
    executable: PathBuf,
    arguments: Vec<String>,
}

/// Collects jobs and turns them into rounds, either submitted to slurm or run locally
#[derive(Debug)]
pub struct JobCluster {
    settings: Settings,
    registry: Arc<Registry>,
    renderer: Renderer,
    launcher: Launcher,
    pending: VecDeque<JobDescriptor>,
    submitted: Vec<JobDescriptor>,
    rounds: Vec<RoundOutcome>,
}

impl JobCluster {
    pub fn new(config: &ClusterConfig, registry: Arc<Registry>) -> Result<Self, ClusterError> {
        Self::with_launcher(config, registry, Launcher::Direct)
    }

    pub fn with_launcher(
        config: &ClusterConfig,
        registry: Arc<Registry>,
        launcher: Launcher,
    ) -> Result<Self, ClusterError> {
        Ok(Self {
            settings: config.preflight_checks()?,
            registry,
            renderer: Renderer::new()?,
            launcher,
            pending: VecDeque::new(),
            submitted: Vec::new(),
            rounds: Vec::new(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn launcher(&self) -> &Launcher {
        &self.launcher
    }

    /// Expand `spec` and queue the resulting jobs, returning how many were added
    ///
    /// Every expanded job is built once so unknown work units and bad arguments are rejected
    /// here, before anything touches the disk. On error nothing is queued.
    pub fn add_job(&mut self, spec: &JobSpec) -> Result<usize, ClusterError> {
        if !self.registry.contains(&spec.work_unit) {
            error!(work_unit = %spec.work_unit, "Refusing job for unknown work unit");

            return Err(ClusterError::InvalidWorkUnit(spec.work_unit.clone()));
        }

        let jobs = spec.expand();
        for job in jobs.iter() {
            self.registry.build(job)?;
        }

        debug!(work_unit = %spec.work_unit, count = jobs.len(), "Queued jobs");

        let count = jobs.len();
        self.pending.extend(jobs);

        Ok(count)
    }

    /// queue an already expanded descriptor
    pub fn add_descriptor(&mut self, job: JobDescriptor) -> Result<(), ClusterError> {
        self.registry.build(&job)?;
        self.pending.push_back(job);

        Ok(())
    }

    /// number of jobs waiting for the next submit/run_local
    pub fn n_jobs(&self) -> usize {
        self.pending.len()
    }

    pub fn jobs_submitted(&self) -> &[JobDescriptor] {
        &self.submitted
    }

    pub fn n_jobs_submitted(&self) -> usize {
        self.submitted.len()
    }

    /// all rounds materialized by this cluster so far
    pub fn rounds(&self) -> &[RoundOutcome] {
        &self.rounds
    }

    /// Materialize all pending jobs and hand every round to the scheduler
    ///
    /// With `do_submit` unset all files are written but the scheduler is never called.
    #[instrument(skip(self), level = "info")]
    pub fn submit(&mut self, do_submit: bool) -> Result<Vec<RoundOutcome>, ClusterError> {
        let old_njobs = self.n_jobs();

        self.drain_rounds(|cluster, materialized, jobs| {
            if !do_submit {
                info!(round = ?materialized.round.path(), "Not actually submitting");

                return RoundStatus::DryRun;
            }

            let status = cluster.invoke_scheduler(&materialized.round.submit_path());
            println!("Submitted {jobs}/{old_njobs} jobs.");

            status
        })
    }

    /// Run all pending jobs on this machine, one task after the other
    ///
    /// Tasks see the same environment as array tasks would. A failing task is logged and the
    /// remaining tasks still run.
    #[instrument(skip(self), level = "info")]
    pub fn run_local(&mut self) -> Result<Vec<RoundOutcome>, ClusterError> {
        self.drain_rounds(|cluster, materialized, jobs| RoundStatus::Local {
            failed: cluster.run_round_locally(materialized, jobs),
        })
    }

    /// shared round loop of submit and run_local
    fn drain_rounds<F>(&mut self, mut process: F) -> Result<Vec<RoundOutcome>, ClusterError>
    where
        F: FnMut(&Self, &Materialized, usize) -> RoundStatus,
    {
        self.remove_notrunning_jobs()?;
        self.check_round_capacity()?;

        let mut outcomes = Vec::new();

        while !self.pending.is_empty() {
            let take = self.settings.max_jobs_per_round.min(self.pending.len());
            let batch = self.pending.drain(..take).collect::<Vec<_>>();

            let materialized = match self.materialize(&batch) {
                Ok(materialized) => materialized,
                Err(error) => {
                    // put the batch back so no job gets lost
                    for job in batch.into_iter().rev() {
                        self.pending.push_front(job);
                    }

                    return Err(error);
                }
            };

            let status = process(self, &materialized, batch.len());
            let outcome = RoundOutcome {
                round: materialized.round,
                jobs: batch.len(),
                status,
            };

            self.submitted.extend(batch);
            self.rounds.push(outcome.clone());
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    /// drop every job whose work unit reports that it does not need to run
    fn remove_notrunning_jobs(&mut self) -> Result<(), ClusterError> {
        let mut kept = VecDeque::with_capacity(self.pending.len());

        for job in self.pending.iter() {
            if self.registry.build(job)?.should_run() {
                kept.push_back(job.clone());
            } else {
                debug!(job = %job, "Skipping job, it does not need to run");
            }
        }

        let skipped = self.pending.len() - kept.len();
        if skipped > 0 {
            info!("Skipped {skipped} jobs that do not need to run");
        }

        self.pending = kept;

        Ok(())
    }

    /// a fixed round directory can only hold a single round
    fn check_round_capacity(&self) -> Result<(), ConfigErrors> {
        if !self.settings.inc_jobsdir && self.pending.len() > self.settings.max_jobs_per_round {
            return Err(ConfigErrors::RoundOverflow {
                jobs: self.pending.len(),
                path: self.settings.jobs_dir.clone(),
            });
        }

        Ok(())
    }

    /// create the round directory, store descriptors and render both scripts
    fn materialize(&self, jobs: &[JobDescriptor]) -> Result<Materialized, ClusterError> {
        let round = prepare_round(&self.settings.jobs_dir, self.settings.inc_jobsdir)?;
        round.persist(jobs)?;

        let task_binary = if self.settings.copy_task_binary {
            round.install_support(&self.settings.task_binary)?
        } else {
            self.settings.task_binary.clone()
        };

        let (executable, arguments) = self
            .launcher
            .command(&self.settings.interpreter, &round.runner_path());
        let context = TemplateContext::new(
            &self.settings,
            &round,
            task_binary,
            &executable,
            &arguments,
            jobs.len(),
        );

        self.renderer
            .write(RUNNER_TEMPLATE, &context, &round.runner_path())?;
        self.renderer
            .write(SUBMIT_TEMPLATE, &context, &round.submit_path())?;

        Ok(Materialized {
            round,
            executable,
            arguments,
        })
    }

    /// call the scheduler once with the submission script, never failing the caller
    fn invoke_scheduler(&self, submit_script: &Path) -> RoundStatus {
        let result = Command::new(&self.settings.submit_command)
            .arg(submit_script)
            .current_dir(&self.settings.working_directory)
            .stdin(Stdio::null())
            .output();

        let output = match result {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));

                println!("Submit output:\n{text}\n");

                if output.status.success() {
                    Ok(text)
                } else {
                    warn!(status = %output.status, "Scheduler rejected the submission");

                    Err(text)
                }
            }
            Err(error) => {
                error!(
                    command = ?self.settings.submit_command,
                    error = %error,
                    "Failed to start the scheduler submit command"
                );

                Err(error.to_string())
            }
        };

        match output {
            Ok(output) => RoundStatus::Submitted { output },
            Err(output) => RoundStatus::SubmitFailed { output },
        }
    }

    /// run tasks 1..=jobs sequentially, returning the indices of failed tasks
    fn run_round_locally(&self, materialized: &Materialized, jobs: usize) -> Vec<usize> {
        let mut failed = Vec::new();

        for index in 1..=jobs {
            let log_path = materialized.round.log_path(index);
            let log = match File::create(&log_path).and_then(|log| Ok((log.try_clone()?, log))) {
                Ok(log) => log,
                Err(error) => {
                    error!(path = ?log_path, error = %error, "Failed to create task log");
                    failed.push(index);

                    continue;
                }
            };

            debug!(task = index, "Running task locally");

            let status = Command::new(&materialized.executable)
                .args(&materialized.arguments)
                .current_dir(&self.settings.working_directory)
                .env(TASK_ID_VARIABLE, index.to_string())
                .env(JOB_ID_VARIABLE, "0")
                .stdin(Stdio::null())
                .stdout(log.0)
                .stderr(log.1)
                .status();

            match status {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    warn!(task = index, status = %status, log = ?log_path, "Task failed");
                    failed.push(index);
                }
                Err(error) => {
                    error!(task = index, error = %error, "Failed to start task");
                    failed.push(index);
                }
            }
        }

        info!("Ran {jobs} tasks locally, {} failed", failed.len());

        failed
    }
}

/// Transparent, thread safe wrapper over `JobCluster`
#[derive(Debug, Clone)]
pub struct SharedJobCluster(Arc<FairMutex<JobCluster>>);

impl SharedJobCluster {
    pub fn new(cluster: JobCluster) -> Self {
        Self(Arc::new(FairMutex::new(cluster)))
    }

    pub fn add_job(&self, spec: &JobSpec) -> Result<usize, ClusterError> {
        self.0.lock().add_job(spec)
    }

    pub fn submit(&self, do_submit: bool) -> Result<Vec<RoundOutcome>, ClusterError> {
        self.0.lock().submit(do_submit)
    }

    pub fn run_local(&self) -> Result<Vec<RoundOutcome>, ClusterError> {
        self.0.lock().run_local()
    }

    pub fn n_jobs(&self) -> usize {
        self.0.lock().n_jobs()
    }

    pub fn n_jobs_submitted(&self) -> usize {
        self.0.lock().n_jobs_submitted()
    }

    /// the submitted jobs at the time of the call
    pub fn jobs_submitted(&self) -> Vec<JobDescriptor> {
        self.0.lock().jobs_submitted().to_vec()
    }
}
