use super::{JobDescriptor, JobError, WorkUnit, WorkUnitType};
use std::{collections::BTreeMap, fmt};
use tracing::{debug, warn};

type Constructor = fn(&JobDescriptor) -> Result<Box<dyn WorkUnit>, JobError>;

/// Name -> constructor lookup for work units
///
/// Descriptors only carry the work unit name, so the submitting process and every task process
/// must populate their registry with the same set of types.
#[derive(Default)]
pub struct Registry {
    constructors: BTreeMap<&'static str, Constructor>,
}

fn construct<T: WorkUnitType>(job: &JobDescriptor) -> Result<Box<dyn WorkUnit>, JobError> {
    Ok(Box::new(T::from_job(job)?))
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// register `T` under `T::NAME`, replacing a previous registration with the same name
    pub fn register<T: WorkUnitType>(&mut self) -> &mut Self {
        if self
            .constructors
            .insert(T::NAME, construct::<T>)
            .is_some()
        {
            warn!(name = T::NAME, "Work unit registered twice, keeping the latest one");
        } else {
            debug!(name = T::NAME, "Registered work unit");
        }

        self
    }

    /// builder variant of [`Registry::register`]
    pub fn with<T: WorkUnitType>(mut self) -> Self {
        self.register::<T>();
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.constructors.keys().copied()
    }

    /// rebuild the work unit a descriptor refers to
    pub fn build(&self, job: &JobDescriptor) -> Result<Box<dyn WorkUnit>, JobError> {
        match self.constructors.get(job.work_unit()) {
            Some(constructor) => constructor(job),
            None => Err(JobError::InvalidWorkUnit(job.work_unit().to_owned())),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.constructors.keys()).finish()
    }
}
