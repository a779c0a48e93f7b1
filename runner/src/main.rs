use jobcluster::{cli, job::units};
use std::process::ExitCode;

fn main() -> ExitCode {
    cli::main_with(units::builtin_registry())
}
