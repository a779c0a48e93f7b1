//! Command line front end shared by `jobcluster` and binaries bundling their own work units
//!
//! A binary with custom work units only needs
//! `fn main() -> ExitCode { jobcluster::cli::main_with(registry) }`, the same binary then acts as
//! submitter and as task binary.

use crate::{
    cluster::{container::ContainerJobCluster, ClusterError, JobCluster, RoundOutcome, RoundStatus},
    config::{ConfigErrors, SweepFile},
    job::Registry,
    round::{RoundError, RoundHandle},
    task::{run_task, TaskContext, TaskError},
};
use clap::{Parser, Subcommand};
use std::{io, path::PathBuf, process::ExitCode, sync::Arc};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "jobcluster")]
#[command(version, about = "Sweep work units over parameters and run them as slurm array jobs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Expand a sweep file and submit it in rounds
    Submit {
        sweep: PathBuf,
        /// write all rounds but don't call the scheduler
        #[arg(long)]
        dry_run: bool,
    },
    /// Expand a sweep file and run every task on this machine
    RunLocal { sweep: PathBuf },
    /// Run a single task of a round, called by the generated runner script
    Task {
        #[arg(long)]
        round: PathBuf,
        /// task index, read from SLURM_ARRAY_TASK_ID if absent
        #[arg(long)]
        index: Option<usize>,
        #[arg(long)]
        job_id: Option<u64>,
        /// requested memory in bytes, only used for the usage report
        #[arg(long, default_value_t = 0)]
        requested_memory: u64,
    },
    /// Print the job descriptors stored in a round
    Show {
        round: PathBuf,
        #[arg(long)]
        index: Option<usize>,
    },
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Round(#[from] RoundError),
    #[error("{0} of {1} local tasks failed")]
    LocalFailures(usize, usize),
}

/// The two kinds of cluster a sweep file can ask for
#[derive(Debug)]
pub enum Clusters {
    Plain(JobCluster),
    Container(ContainerJobCluster),
}

impl Clusters {
    /// build the cluster described by `sweep` and queue all of its jobs
    pub fn load(sweep: &SweepFile, registry: Arc<Registry>) -> Result<Self, ClusterError> {
        let mut cluster = match &sweep.container {
            Some(container) => Self::Container(ContainerJobCluster::new(
                &sweep.cluster,
                container,
                registry,
            )?),
            None => Self::Plain(JobCluster::new(&sweep.cluster, registry)?),
        };

        for spec in sweep.jobs.iter() {
            cluster.cluster_mut().add_job(spec)?;
        }

        info!(jobs = cluster.cluster().n_jobs(), "Loaded sweep");

        Ok(cluster)
    }

    pub fn cluster(&self) -> &JobCluster {
        match self {
            Self::Plain(cluster) => cluster,
            Self::Container(cluster) => cluster,
        }
    }

    pub fn cluster_mut(&mut self) -> &mut JobCluster {
        match self {
            Self::Plain(cluster) => cluster,
            Self::Container(cluster) => cluster,
        }
    }

    pub fn submit(&mut self, do_submit: bool) -> Result<Vec<RoundOutcome>, ClusterError> {
        match self {
            Self::Plain(cluster) => cluster.submit(do_submit),
            Self::Container(cluster) => cluster.submit(do_submit),
        }
    }

    pub fn run_local(&mut self) -> Result<Vec<RoundOutcome>, ClusterError> {
        self.cluster_mut().run_local()
    }
}

/// log to stderr, `RUST_LOG` overrides the default `info` level
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // a second initialization (e.g. in tests) is not an error worth reporting
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// parse the command line and run it with the work units in `registry`
pub fn main_with(registry: Registry) -> ExitCode {
    init_tracing();

    match run(Cli::parse(), Arc::new(registry)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("Error: {error}");

            ExitCode::FAILURE
        }
    }
}

pub fn run(cli: Cli, registry: Arc<Registry>) -> Result<(), CliError> {
    match cli.command {
        Commands::Submit { sweep, dry_run } => {
            let sweep = SweepFile::load(&sweep)?;
            let outcomes = Clusters::load(&sweep, registry)?.submit(!dry_run)?;

            for outcome in outcomes.iter() {
                println!("{}", describe(outcome));
            }

            Ok(())
        }
        Commands::RunLocal { sweep } => {
            let sweep = SweepFile::load(&sweep)?;
            let outcomes = Clusters::load(&sweep, registry)?.run_local()?;

            let mut total = 0;
            let mut failed = 0;
            for outcome in outcomes.iter() {
                println!("{}", describe(outcome));

                total += outcome.jobs;
                if let RoundStatus::Local { failed: indices } = &outcome.status {
                    failed += indices.len();
                }
            }

            match failed {
                0 => Ok(()),
                failed => Err(CliError::LocalFailures(failed, total)),
            }
        }
        Commands::Task {
            round,
            index,
            job_id,
            requested_memory,
        } => {
            let context = match index {
                Some(0) => return Err(TaskError::ZeroIndex.into()),
                Some(index) => TaskContext::new(round, index, job_id.unwrap_or(0), requested_memory),
                None => TaskContext::from_env(round, requested_memory)?,
            };

            run_task(&registry, &context)?;

            Ok(())
        }
        Commands::Show { round, index } => {
            let round = RoundHandle::open(round);
            let indices = match index {
                Some(index) => vec![index],
                None => (1..=round.len()).collect(),
            };

            for index in indices {
                println!("{index:>4}: {}", round.load(index)?);
            }

            Ok(())
        }
    }
}

fn describe(outcome: &RoundOutcome) -> String {
    let path = outcome.round.path().display();

    match &outcome.status {
        RoundStatus::DryRun => format!("{path}: {} jobs written, not submitted", outcome.jobs),
        RoundStatus::Submitted { .. } => format!("{path}: {} jobs submitted", outcome.jobs),
        RoundStatus::SubmitFailed { .. } => {
            format!("{path}: submission of {} jobs failed", outcome.jobs)
        }
        RoundStatus::Local { failed } if failed.is_empty() => {
            format!("{path}: {} jobs ran locally", outcome.jobs)
        }
        RoundStatus::Local { failed } => format!(
            "{path}: {} jobs ran locally, failed tasks {failed:?}",
            outcome.jobs
        ),
    }
}
