use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};

use crate::build_driver::exit_code;
use crate::layout::{DirectoryLayout, Platform};
use crate::matrix::MatrixCell;
use crate::report::Reporter;

pub const DEFAULT_TEST_EXECUTABLE: &str = "testapp";

#[derive(Debug, Clone)]
pub struct TestRunner {
    pub root: PathBuf,
    pub platform: Platform,
    pub executable: String,
}

impl TestRunner {
    pub fn executable_path(&self, cell: MatrixCell) -> PathBuf {
        DirectoryLayout::for_cell(&self.root, self.platform, cell)
            .test_executable(self.platform, &self.executable)
    }

    /// Runs the flavor's test executable against one fixture. Output is not
    /// captured and no timeout applies.
    pub fn run(&self, cell: MatrixCell, fixture_path: &Path, reporter: &Reporter) -> Result<i32> {
        let exe = self.executable_path(cell);
        reporter.progress(&format!(
            "Launching \"{} {}\"..",
            exe.display(),
            fixture_path.display()
        ));
        let status = Command::new(&exe)
            .arg(fixture_path)
            .status()
            .with_context(|| format!("exec {}", exe.display()))?;
        Ok(exit_code(status))
    }
}
