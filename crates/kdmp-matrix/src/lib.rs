//! Build-and-test matrix orchestration for the kdmp-parser native library.
//!
//! Every `(architecture, configuration)` flavor is configured and built with
//! cmake into its own directory pair, the shared crash-dump fixtures are
//! fetched once, and each flavor's `testapp` is run against every fixture.
//! The first non-zero exit code ends the run.

pub mod build_driver;
pub mod config;
pub mod env;
pub mod fetch;
pub mod layout;
pub mod matrix;
pub mod orchestrator;
pub mod report;
pub mod test_runner;

pub use build_driver::BuildDriver;
pub use config::Config;
pub use env::{BuildEnvironment, EnvironmentResolver};
pub use fetch::{ArtifactFetcher, Fixture};
pub use layout::{DirectoryLayout, Platform};
pub use matrix::{Arch, Configuration, MatrixCell, MatrixSelection, MatrixSpec};
pub use orchestrator::{
    Failure, MatrixTools, Orchestrator, Outcome, ProcessTools, RunPlan, State,
};
pub use report::Reporter;
pub use test_runner::TestRunner;
