use crate::expand::JobSpec;
use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use std::{
    env,
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::error;

/// scheduler paths mounted into containers so slurm commands keep working inside them
pub const SLURM_FOLDERS: [&str; 2] = ["/etc/slurm", "/var/run/munge"];

/// container runtimes probed in order when none is configured
pub const DEFAULT_RUNTIMES: [&str; 2] = ["/usr/bin/apptainer", "/usr/bin/singularity"];

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File {0:?} not found")]
    FileNotFound(PathBuf),
    #[error("File {0:?} is not executable")]
    NotExecutable(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[source] Error),
    #[error("I/O error while loading configuration")]
    Io(#[from] Error),
    #[error("Working directory {0:?} is not a directory")]
    WorkingDirectory(PathBuf),
    #[error("Memory requirement `{value}` is invalid: {reason}")]
    InvalidMemory { value: String, reason: String },
    #[error("max_jobs_per_round must be at least 1")]
    InvalidMaxJobs,
    #[error("{jobs} jobs need more than one round but {path:?} is not an incrementing jobs directory")]
    RoundOverflow { jobs: usize, path: PathBuf },
    #[error("No container runtime found, tried {0:?}")]
    ContainerRuntimeNotFound(Vec<PathBuf>),
    #[error("A container image must be specified")]
    MissingImage,
    #[error("Path {0:?} contains whitespace, which #SBATCH directives cannot express")]
    UnsupportedPath(PathBuf),
    #[error("Failed to parse configuration")]
    Yaml(#[from] serde_yaml::Error),
}

// `--chdir` and `--output` take the rest of the line verbatim
fn check_directive_path(path: &Path) -> Result<(), ConfigErrors> {
    match path.to_string_lossy().chars().any(char::is_whitespace) {
        true => Err(ConfigErrors::UnsupportedPath(path.to_path_buf())),
        false => Ok(()),
    }
}

/// Memory requirement, either a byte count or a human readable size like `2G` or `512MiB`
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum Memory {
    Bytes(u64),
    Human(String),
}

impl Memory {
    /// normalize to bytes, decimal units (`G`) and binary units (`GiB`) are both accepted
    pub fn to_bytes(&self) -> Result<u64, ConfigErrors> {
        match self {
            Self::Bytes(bytes) => Ok(*bytes),
            Self::Human(value) => value
                .trim()
                .parse::<ByteSize>()
                .map(|size| size.as_u64())
                .map_err(|reason| ConfigErrors::InvalidMemory {
                    value: value.clone(),
                    reason,
                }),
        }
    }
}

impl From<u64> for Memory {
    fn from(bytes: u64) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&str> for Memory {
    fn from(value: &str) -> Self {
        Self::Human(value.to_owned())
    }
}

/// Everything needed to materialize and submit rounds, as written by users
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    // memory per job, see Memory
    #[serde(alias = "required_ram")]
    pub required_memory: Memory,
    pub request_cpus: u32,
    // wall time limit in minutes
    pub request_time: u64,
    // parent of all rounds, or the round itself if inc_jobsdir is false
    pub jobs_dir: PathBuf,
    pub inc_jobsdir: bool,
    pub qos: Option<String>,
    // shell used to run the rendered runner script
    pub interpreter: PathBuf,
    // binary with all work units registered, defaults to the current executable
    pub task_binary: Option<PathBuf>,
    pub copy_task_binary: bool,
    pub working_directory: Option<PathBuf>,
    pub exclude_nodes: Vec<String>,
    // slurm limits the size of array jobs
    #[serde(alias = "max_jobs_per_jobcluster")]
    pub max_jobs_per_round: usize,
    pub append_to_path: Vec<PathBuf>,
    // passed verbatim as `#SBATCH <arg>`
    pub extra_slurm_args: Vec<String>,
    // see sbatch --export
    pub export: String,
    pub submit_command: PathBuf,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            required_memory: Memory::Human("2G".to_owned()),
            request_cpus: 1,
            request_time: 10,
            jobs_dir: PathBuf::from("jobs"),
            inc_jobsdir: true,
            qos: None,
            interpreter: PathBuf::from("/bin/sh"),
            task_binary: None,
            copy_task_binary: true,
            working_directory: None,
            exclude_nodes: Vec::new(),
            max_jobs_per_round: 1000,
            append_to_path: Vec::new(),
            extra_slurm_args: Vec::new(),
            export: "NONE".to_owned(),
            submit_command: PathBuf::from("/usr/bin/sbatch"),
        }
    }
}

/// Validated and normalized form of `ClusterConfig`
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub required_memory: u64,
    pub request_cpus: u32,
    pub request_time: u64,
    pub jobs_dir: PathBuf,
    pub inc_jobsdir: bool,
    pub qos: Option<String>,
    pub interpreter: PathBuf,
    pub task_binary: PathBuf,
    pub copy_task_binary: bool,
    pub working_directory: PathBuf,
    pub exclude_nodes: Vec<String>,
    pub max_jobs_per_round: usize,
    pub append_to_path: Vec<PathBuf>,
    pub extra_slurm_args: Vec<String>,
    pub export: String,
    pub submit_command: PathBuf,
}

impl Settings {
    /// requested memory in whole megabytes, as expected by `sbatch --mem`
    pub fn required_megabytes(&self) -> u64 {
        self.required_memory / 1024 / 1024
    }
}

fn require_executable(path: &Path) -> Result<PathBuf, ConfigErrors> {
    if check_executable(path)? {
        Ok(path.to_path_buf())
    } else {
        Err(ConfigErrors::NotExecutable(path.to_path_buf()))
    }
}

impl ClusterConfig {
    /// Validate the configuration and resolve all defaults
    ///
    /// Every problem is logged so users can fix them in one go, the first one is returned.
    pub fn preflight_checks(&self) -> Result<Settings, ConfigErrors> {
        let mut errors = Vec::new();

        let required_memory = self
            .required_memory
            .to_bytes()
            .map_err(|e| errors.push(e))
            .unwrap_or_default();

        let interpreter = require_executable(&self.interpreter)
            .map_err(|e| errors.push(e))
            .unwrap_or_default();

        let task_binary = match &self.task_binary {
            Some(path) => require_executable(path),
            None => env::current_exe()
                .map_err(ConfigErrors::from)
                .and_then(|path| require_executable(&path)),
        }
        .map_err(|e| errors.push(e))
        .unwrap_or_default();

        let working_directory = match &self.working_directory {
            Some(path) => Ok(path.clone()),
            None => env::current_dir().map_err(ConfigErrors::from),
        }
        .and_then(|path| {
            if path.is_dir() {
                fs::canonicalize(&path).map_err(ConfigErrors::from)
            } else {
                Err(ConfigErrors::WorkingDirectory(path))
            }
        })
        .map_err(|e| errors.push(e))
        .unwrap_or_default();

        // round logs live below the jobs directory
        let jobs_dir = match self.jobs_dir.is_absolute() {
            true => Ok(self.jobs_dir.clone()),
            false => env::current_dir()
                .map(|cwd| cwd.join(&self.jobs_dir))
                .map_err(ConfigErrors::from),
        };
        for path in [Ok(working_directory.clone()), jobs_dir] {
            if let Err(e) = path.and_then(|path| check_directive_path(&path)) {
                errors.push(e);
            }
        }

        if self.max_jobs_per_round == 0 {
            errors.push(ConfigErrors::InvalidMaxJobs);
        }

        for error in errors.iter() {
            error!("Invalid cluster configuration: {error}");
        }

        match errors.into_iter().next() {
            Some(error) => Err(error),
            None => Ok(Settings {
                required_memory,
                request_cpus: self.request_cpus,
                request_time: self.request_time,
                jobs_dir: self.jobs_dir.clone(),
                inc_jobsdir: self.inc_jobsdir,
                qos: self.qos.clone(),
                interpreter,
                task_binary,
                copy_task_binary: self.copy_task_binary,
                working_directory,
                exclude_nodes: self.exclude_nodes.clone(),
                max_jobs_per_round: self.max_jobs_per_round,
                append_to_path: self.append_to_path.clone(),
                extra_slurm_args: self.extra_slurm_args.clone(),
                export: self.export.clone(),
                submit_command: self.submit_command.clone(),
            }),
        }
    }
}

/// Container settings for running every task through apptainer/singularity
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ContainerConfig {
    // local path or remote reference (e.g. docker://...)
    pub image: String,
    #[serde(default = "default_mounts")]
    pub mounts: Vec<String>,
    #[serde(default = "default_true")]
    pub mount_slurm_folders: bool,
    // extra runtime flags, inserted after the bind mounts
    #[serde(default)]
    pub args: String,
    #[serde(default = "default_true")]
    pub prepull: bool,
    // explicit runtime binary, otherwise DEFAULT_RUNTIMES are probed
    #[serde(default)]
    pub runtime: Option<PathBuf>,
    // seconds to wait for the pre-pull before giving up on it
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout: u64,
}

impl ContainerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            mounts: default_mounts(),
            mount_slurm_folders: true,
            args: String::new(),
            prepull: true,
            runtime: None,
            pull_timeout: default_pull_timeout(),
        }
    }

    /// locate the container runtime binary
    pub fn resolve_runtime(&self) -> Result<PathBuf, ConfigErrors> {
        let candidates = match &self.runtime {
            Some(runtime) => vec![runtime.clone()],
            None => DEFAULT_RUNTIMES.iter().map(PathBuf::from).collect(),
        };

        match candidates.iter().find(|candidate| candidate.is_file()) {
            Some(runtime) => Ok(runtime.clone()),
            None => {
                error!(tried = ?candidates, "Neither apptainer nor singularity found");

                Err(ConfigErrors::ContainerRuntimeNotFound(candidates))
            }
        }
    }

    /// bind mounts in order, slurm folders appended unless already present
    pub fn resolved_mounts(&self) -> Vec<String> {
        let mut mounts = self.mounts.clone();

        if self.mount_slurm_folders {
            for folder in SLURM_FOLDERS {
                if !mounts.iter().any(|mount| mount == folder) {
                    mounts.push(folder.to_owned());
                }
            }
        }

        mounts
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout)
    }
}

/// A complete sweep as consumed by the CLI
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SweepFile {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub container: Option<ContainerConfig>,
    pub jobs: Vec<JobSpec>,
}

impl SweepFile {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_reader(File::open(path)?)?)
    }
}

fn default_mounts() -> Vec<String> {
    vec!["/mnt".to_owned()]
}

fn default_true() -> bool {
    true
}

fn default_pull_timeout() -> u64 {
    3600
}
