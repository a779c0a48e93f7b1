//! Parameter sweeps over registered work units, submitted as slurm array jobs
//!
//! A sweep is a set of [`expand::JobSpec`]s. Each spec expands into job descriptors, a
//! [`cluster::JobCluster`] batches them into numbered rounds on disk, renders a runner and a
//! submission script per round and hands the latter to `sbatch`. Every array task then re-enters
//! the same binary through `jobcluster task`, loads its descriptor and runs the work unit.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod expand;
pub mod job;
pub mod round;
pub mod task;
pub mod template;

pub use cluster::{container::ContainerJobCluster, JobCluster, SharedJobCluster};
pub use config::{ClusterConfig, ContainerConfig};
pub use expand::{Arg, JobSpec};
pub use job::{JobDescriptor, Registry, WorkUnit, WorkUnitType};

#[cfg(test)]
mod expand_test;
#[cfg(test)]
mod template_test;
#[cfg(test)]
mod test_util;
