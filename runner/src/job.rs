pub mod registry;
pub mod units;


use crate::task::{TaskContext, TaskError};
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
};
use thiserror::Error;
use tracing::trace;

pub use registry::Registry;
pub use serde_json::Value;

/// keyword arguments of a job, in insertion order
pub type Kwargs = IndexMap<String, Value>;

/// zstd level used for descriptor files, they are tiny so speed wins
const COMPRESSION_LEVEL: i32 = 3;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Work unit `{0}` is not registered")]
    InvalidWorkUnit(String),
    #[error("Work unit `{unit}` requires argument {argument}")]
    MissingArgument { unit: String, argument: String },
    #[error("Argument {argument} of `{unit}` is invalid: {source}")]
    InvalidArgument {
        unit: String,
        argument: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to (de)serialize job descriptor")]
    Serialization(#[from] serde_json::Error),
    #[error("Failed to access job descriptor file")]
    Io(#[from] std::io::Error),
}

/// The logic executed by a single array task
///
/// Work units are built from a [`JobDescriptor`] inside the task process, so everything they need
/// has to be derived from the descriptor arguments.
pub trait WorkUnit {
    /// execute the work unit, output goes straight into the task log
    fn run(&self, context: &TaskContext) -> Result<(), TaskError>;

    /// return false if the work was already done, such jobs are dropped before submitting
    fn should_run(&self) -> bool {
        true
    }
}

/// A work unit that can be registered by name and rebuilt from a descriptor
pub trait WorkUnitType: WorkUnit + Sized + 'static {
    /// stable name written into every descriptor
    const NAME: &'static str;

    fn from_job(job: &JobDescriptor) -> Result<Self, JobError>;
}

/// Replayable description of one job: the work unit name and its arguments
///
/// Descriptors are immutable, the fields can only be read after construction.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JobDescriptor {
    work_unit: String,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    kwargs: Kwargs,
}

impl JobDescriptor {
    pub fn new(work_unit: impl Into<String>, args: Vec<Value>, kwargs: Kwargs) -> Self {
        Self {
            work_unit: work_unit.into(),
            args,
            kwargs,
        }
    }

    pub fn work_unit(&self) -> &str {
        &self.work_unit
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Kwargs {
        &self.kwargs
    }

    /// deserialize the positional argument at `index`
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, JobError> {
        let argument = format!("#{index}");

        match self.args.get(index) {
            Some(value) => self.convert(value, argument),
            None => Err(JobError::MissingArgument {
                unit: self.work_unit.clone(),
                argument,
            }),
        }
    }

    /// deserialize the keyword argument `name` if present
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, JobError> {
        self.kwargs
            .get(name)
            .map(|value| self.convert(value, name.to_owned()))
            .transpose()
    }

    /// deserialize the keyword argument `name`, failing if it is absent
    pub fn required_kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<T, JobError> {
        self.kwarg(name)?.ok_or_else(|| JobError::MissingArgument {
            unit: self.work_unit.clone(),
            argument: name.to_owned(),
        })
    }

    fn convert<T: DeserializeOwned>(&self, value: &Value, argument: String) -> Result<T, JobError> {
        serde_json::from_value(value.clone()).map_err(|source| JobError::InvalidArgument {
            unit: self.work_unit.clone(),
            argument,
            source,
        })
    }

    /// write the descriptor as zstd compressed JSON, never overwriting an existing file
    pub fn write_to(&self, path: &Path) -> Result<(), JobError> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let mut encoder = zstd::stream::write::Encoder::new(BufWriter::new(file), COMPRESSION_LEVEL)?;

        serde_json::to_writer(&mut encoder, self)?;
        encoder.finish()?.flush()?;

        trace!(path = ?path, "Wrote job descriptor");

        Ok(())
    }

    /// read a descriptor previously written with [`JobDescriptor::write_to`]
    pub fn read_from(path: &Path) -> Result<Self, JobError> {
        let decoder = zstd::stream::read::Decoder::new(File::open(path)?)?;

        Ok(serde_json::from_reader(decoder)?)
    }
}

/// plain rendering of an argument value: strings unquoted, everything else as JSON
pub(crate) fn display_value(value: &Value) -> String {
    match value {
        Value::String(string) => string.clone(),
        other => other.to_string(),
    }
}

impl fmt::Display for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = self.args.iter().map(Value::to_string);
        let kwargs = self.kwargs.iter().map(|(name, value)| format!("{name}={value}"));

        write!(f, "{}({})", self.work_unit, args.chain(kwargs).join(", "))
    }
}
