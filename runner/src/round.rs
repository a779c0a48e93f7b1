use crate::job::{JobDescriptor, JobError};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

/// subdirectory holding one descriptor file per array task
pub const JOBS_DIR: &str = "jobs";
/// subdirectory holding one log file per array task
pub const LOG_DIR: &str = "log";
/// subdirectory holding the copy of the task binary
pub const SUPPORT_DIR: &str = "bin";

pub const RUNNER_FILE: &str = "runner.sh";
pub const SUBMIT_FILE: &str = "submit.sh";

const DESCRIPTOR_EXTENSION: &str = "json.zst";

#[derive(Error, Debug)]
pub enum RoundError {
    #[error("Round directory {0:?} already exists, refusing to overwrite it")]
    DirectoryConflict(PathBuf),
    #[error("No job descriptor for task {index} in {round:?}")]
    MissingDescriptor { index: usize, round: PathBuf },
    #[error("Failed to prepare round directory")]
    Io(#[from] io::Error),
    #[error("Failed to store job descriptor")]
    Job(#[from] JobError),
}

/// zero padded round directory name
fn round_name(number: u32) -> String {
    format!("{number:03}")
}

/// Handle on one round directory
///
/// Layout:
/// ```text
/// <round>/jobs/job001.json.zst ...   descriptors, index == array task index
/// <round>/log/out_1.log ...          task logs, created when a task runs
/// <round>/bin/<task binary>          copy of the binary able to decode the descriptors
/// <round>/runner.sh, submit.sh       rendered scripts
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RoundHandle {
    path: PathBuf,
}

/// Create a fresh round below or at `base`
///
/// With `incrementing` set, `base` is a parent and the smallest unused three digit number is
/// claimed. Otherwise `base` itself becomes the round and must not exist yet. Directory creation
/// is what claims a round, so two submitters can never end up sharing one.
pub fn prepare_round(base: &Path, incrementing: bool) -> Result<RoundHandle, RoundError> {
    let path = if incrementing {
        fs::create_dir_all(base)?;

        let mut number = 1;
        loop {
            let candidate = base.join(round_name(number));

            match fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => number += 1,
                Err(error) => return Err(error.into()),
            }
        }
    } else {
        if base.exists() {
            return Err(RoundError::DirectoryConflict(base.to_path_buf()));
        }

        if let Some(parent) = base.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        match fs::create_dir(base) {
            Ok(()) => base.to_path_buf(),
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                return Err(RoundError::DirectoryConflict(base.to_path_buf()))
            }
            Err(error) => return Err(error.into()),
        }
    };

    let round = RoundHandle {
        path: fs::canonicalize(&path)?,
    };
    fs::create_dir(round.jobs_dir())?;
    fs::create_dir(round.log_dir())?;

    info!(path = ?round.path, "Prepared round directory");

    Ok(round)
}

impl RoundHandle {
    /// open an existing round, e.g. from inside a task
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.path.join(JOBS_DIR)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.path.join(LOG_DIR)
    }

    pub fn support_dir(&self) -> PathBuf {
        self.path.join(SUPPORT_DIR)
    }

    pub fn runner_path(&self) -> PathBuf {
        self.path.join(RUNNER_FILE)
    }

    pub fn submit_path(&self) -> PathBuf {
        self.path.join(SUBMIT_FILE)
    }

    /// descriptor file for the 1-based array task `index`
    pub fn descriptor_path(&self, index: usize) -> PathBuf {
        self.jobs_dir()
            .join(format!("job{index:03}.{DESCRIPTOR_EXTENSION}"))
    }

    /// log file for the 1-based array task `index`
    pub fn log_path(&self, index: usize) -> PathBuf {
        self.log_dir().join(format!("out_{index}.log"))
    }

    /// number of the round, if the directory name is numeric
    pub fn number(&self) -> Option<u32> {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.parse().ok())
    }

    /// write `jobs` as descriptors 1..=n, returning the written paths in order
    pub fn persist(&self, jobs: &[JobDescriptor]) -> Result<Vec<PathBuf>, RoundError> {
        let paths = jobs
            .iter()
            .enumerate()
            .map(|(offset, job)| {
                let path = self.descriptor_path(offset + 1);
                job.write_to(&path)?;

                Ok(path)
            })
            .collect::<Result<Vec<_>, RoundError>>()?;

        debug!(round = ?self.path, count = paths.len(), "Persisted job descriptors");

        Ok(paths)
    }

    /// read back the descriptor of task `index`
    pub fn load(&self, index: usize) -> Result<JobDescriptor, RoundError> {
        let path = self.descriptor_path(index);

        if !path.is_file() {
            return Err(RoundError::MissingDescriptor {
                index,
                round: self.path.clone(),
            });
        }

        Ok(JobDescriptor::read_from(&path)?)
    }

    /// number of descriptors stored in the round, indices are contiguous from 1
    pub fn len(&self) -> usize {
        (1..)
            .take_while(|index| self.descriptor_path(*index).is_file())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the task binary into the round so later rebuilds of it can't break pending tasks
    pub fn install_support(&self, binary: &Path) -> Result<PathBuf, RoundError> {
        let support_dir = self.support_dir();
        fs::create_dir_all(&support_dir)?;

        let target = support_dir.join(binary.file_name().unwrap_or(binary.as_os_str()));
        // fs::copy keeps the permission bits, so the copy stays executable
        fs::copy(binary, &target)?;

        debug!(source = ?binary, target = ?target, "Installed task binary into round");

        Ok(target)
    }
}
