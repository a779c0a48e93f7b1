//! Everything that happens inside a single array task
//!
//! The runner script execs the task binary, which loads exactly one descriptor from the round,
//! rebuilds its work unit from the registry, runs it and prints a resource usage summary.

use crate::{
    job::{JobError, Registry},
    round::{RoundError, RoundHandle},
};
use chrono::Local;
use nix::sys::resource::{getrusage, UsageWho};
use std::{
    env, fmt,
    io::{self, Write},
    path::PathBuf,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{info, instrument, warn};

/// 1-based index of the array task, also the descriptor number
pub const TASK_ID_VARIABLE: &str = "SLURM_ARRAY_TASK_ID";
/// id of the whole array job, only used for display
pub const JOB_ID_VARIABLE: &str = "SLURM_ARRAY_JOB_ID";

const GIGABYTE: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Environment variable {0} is not set")]
    MissingEnvironment(&'static str),
    #[error("Environment variable {variable} must be an integer, got `{value}`")]
    InvalidEnvironment {
        variable: &'static str,
        value: String,
    },
    #[error("Task indices start at 1")]
    ZeroIndex,
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Round(#[from] RoundError),
    #[error("Failed to query resource usage")]
    ResourceUsage(#[from] nix::Error),
    #[error("I/O error while running the task")]
    Io(#[from] io::Error),
    #[error("Work unit failed: {0}")]
    Failed(String),
}

/// The scheduler environment of one task, made explicit
#[derive(Debug, Clone, PartialEq)]
pub struct TaskContext {
    pub index: usize,
    pub job_id: u64,
    // in bytes
    pub requested_memory: u64,
    pub round: PathBuf,
}

impl TaskContext {
    pub fn new(round: impl Into<PathBuf>, index: usize, job_id: u64, requested_memory: u64) -> Self {
        Self {
            index,
            job_id,
            requested_memory,
            round: round.into(),
        }
    }

    /// read task index and job id from the process environment
    pub fn from_env(round: impl Into<PathBuf>, requested_memory: u64) -> Result<Self, TaskError> {
        Self::from_lookup(round, requested_memory, |name| env::var(name).ok())
    }

    /// Build the context from an arbitrary variable lookup
    ///
    /// The task index is required, a missing job id is treated as 0.
    pub fn from_lookup<F>(
        round: impl Into<PathBuf>,
        requested_memory: u64,
        lookup: F,
    ) -> Result<Self, TaskError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let index = match lookup(TASK_ID_VARIABLE) {
            Some(value) => parse_variable(TASK_ID_VARIABLE, &value)?,
            None => return Err(TaskError::MissingEnvironment(TASK_ID_VARIABLE)),
        };

        if index == 0 {
            return Err(TaskError::ZeroIndex);
        }

        let job_id = match lookup(JOB_ID_VARIABLE) {
            Some(value) => parse_variable(JOB_ID_VARIABLE, &value)?,
            None => 0,
        };

        Ok(Self::new(round, index, job_id, requested_memory))
    }
}

fn parse_variable<T: std::str::FromStr>(variable: &'static str, value: &str) -> Result<T, TaskError> {
    value
        .trim()
        .parse()
        .map_err(|_| TaskError::InvalidEnvironment {
            variable,
            value: value.to_owned(),
        })
}

/// CPU time and peak memory of the current process and its waited-for children
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    pub cpu_time: Duration,
    // kibibytes, as reported by getrusage on linux
    pub max_rss: u64,
}

fn usage_of(who: UsageWho) -> Result<ResourceUsage, TaskError> {
    let usage = getrusage(who)?;
    let to_duration = |time: nix::sys::time::TimeVal| {
        Duration::from_secs(time.tv_sec().max(0) as u64)
            + Duration::from_micros(time.tv_usec().max(0) as u64)
    };

    Ok(ResourceUsage {
        cpu_time: to_duration(usage.user_time()) + to_duration(usage.system_time()),
        max_rss: usage.max_rss().max(0) as u64,
    })
}

impl ResourceUsage {
    /// Work units like `exec` do everything in child processes, so those count as well
    ///
    /// CPU time is summed, peak memory is the larger of this process and its biggest child.
    pub fn current() -> Result<Self, TaskError> {
        let own = usage_of(UsageWho::RUSAGE_SELF)?;
        let children = usage_of(UsageWho::RUSAGE_CHILDREN)?;

        Ok(Self {
            cpu_time: own.cpu_time + children.cpu_time,
            max_rss: own.max_rss.max(children.max_rss),
        })
    }
}

/// average number of cores used, one core if the task took less than a second
pub fn average_cpus(cpu_time: Duration, wall: Duration) -> f64 {
    match wall.as_secs() {
        0 => 1.0,
        seconds => cpu_time.as_secs_f64() / seconds as f64,
    }
}

/// Requested versus used resources of a finished task
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceReport {
    pub wall: Duration,
    pub average_cpus: f64,
    pub requested_gb: f64,
    pub used_gb: f64,
}

impl ResourceReport {
    pub fn new(
        before: ResourceUsage,
        after: ResourceUsage,
        wall: Duration,
        requested_memory: u64,
    ) -> Self {
        Self {
            wall,
            average_cpus: average_cpus(after.cpu_time.saturating_sub(before.cpu_time), wall),
            requested_gb: requested_memory as f64 / GIGABYTE,
            used_gb: after.max_rss as f64 / 1024.0 / 1024.0,
        }
    }

    /// by how many percent the requested memory exceeds the used memory
    pub fn overestimation(&self) -> Option<f64> {
        (self.used_gb > 0.0).then(|| 100.0 * (self.requested_gb - self.used_gb) / self.used_gb)
    }
}

impl fmt::Display for ResourceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Your job used an average of {:.2} CPUs", self.average_cpus)?;
        writeln!(f, "Your job asked for {:.2}GB of RAM", self.requested_gb)?;
        writeln!(f, "Your job used a maximum of {:.2}GB of RAM", self.used_gb)?;

        match self.overestimation() {
            Some(percent) => write!(f, "You overestimated your memory usage by {percent:.2}%."),
            None => write!(f, "No memory usage was recorded."),
        }
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_owned())
}

fn cpu_affinity() -> String {
    match affinity::get_thread_affinity() {
        Ok(cores) => format!("{cores:?}"),
        Err(error) => format!("unknown ({error})"),
    }
}

/// Run the job `context` points to and print the usage summary
///
/// The report is printed even if the work unit fails, the failure is returned afterwards.
#[instrument(skip(registry), level = "info")]
pub fn run_task(registry: &Registry, context: &TaskContext) -> Result<ResourceReport, TaskError> {
    let round = RoundHandle::open(&context.round);
    let job = round.load(context.index)?;
    let unit = registry.build(&job)?;

    let before = ResourceUsage::current()?;

    println!("Running on: {}", hostname());
    println!("Running on CPUs: {}", cpu_affinity());
    println!("Now running {job}");
    println!("Parameters: {:?}", job.args());
    println!("Keyword Parameters: {:?}", job.kwargs());
    println!("Job ID: {}, Task ID: {}", context.job_id, context.index);

    let started = Local::now();
    println!("Starting Job at {started}\n##########");
    io::stdout().flush()?;

    let clock = Instant::now();
    let result = unit.run(context);
    let wall = clock.elapsed();

    io::stdout().flush()?;
    println!("##########\nJob stopped at {}", Local::now());
    println!("Execution took {wall:?}");

    let report = ResourceReport::new(before, ResourceUsage::current()?, wall, context.requested_memory);
    println!("{report}");

    match result {
        Ok(()) => {
            info!(task = context.index, "Task finished");

            Ok(report)
        }
        Err(error) => {
            warn!(task = context.index, error = %error, "Task failed");

            Err(error)
        }
    }
}
