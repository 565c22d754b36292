use std::path::PathBuf;
use std::process::{Command, ExitStatus};

use anyhow::{Context, Result};

use crate::env::{BuildEnvironment, EnvironmentResolver};
use crate::layout::{DirectoryLayout, Platform};
use crate::matrix::MatrixCell;
use crate::report::Reporter;

pub const DEFAULT_CMAKE: &str = "cmake";
pub const DEFAULT_GENERATOR: &str = "Ninja";

/// Signal deaths carry no exit code; they still count as a failure.
pub fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[derive(Debug, Clone)]
pub struct BuildDriver {
    pub root: PathBuf,
    pub source_root: PathBuf,
    pub platform: Platform,
    pub cmake: PathBuf,
    pub generator: String,
    pub resolver: EnvironmentResolver,
}

impl BuildDriver {
    pub fn layout(&self, cell: MatrixCell) -> DirectoryLayout {
        DirectoryLayout::for_cell(&self.root, self.platform, cell)
    }

    /// Configures then builds one flavor. Returns the first non-zero tool
    /// exit code, or the build step's code.
    pub fn build(&self, cell: MatrixCell, reporter: &Reporter) -> Result<i32> {
        let env = self
            .resolver
            .resolve(cell.arch)
            .with_context(|| format!("resolve build environment for {cell}"))?;
        let layout = self.layout(cell);
        layout.ensure()?;

        reporter.progress(&format!(
            "configure {cell} in {}",
            layout.build_dir.display()
        ));
        let code = self.run_tool(self.configure_command(cell, &layout, &env), "configure")?;
        if code != 0 {
            return Ok(code);
        }

        reporter.progress(&format!("build {cell}"));
        self.run_tool(self.build_command(&layout, &env), "build")
    }

    pub fn configure_command(
        &self,
        cell: MatrixCell,
        layout: &DirectoryLayout,
        env: &BuildEnvironment,
    ) -> Command {
        let mut cmd = Command::new(&self.cmake);
        cmd.arg(format!(
            "-DCMAKE_RUNTIME_OUTPUT_DIRECTORY={}",
            layout.output_dir.display()
        ))
        .arg(format!("-DCMAKE_BUILD_TYPE={}", cell.configuration))
        .arg(format!("-G{}", self.generator))
        .arg(&self.source_root)
        .current_dir(&layout.build_dir);
        env.apply(&mut cmd);
        cmd
    }

    pub fn build_command(&self, layout: &DirectoryLayout, env: &BuildEnvironment) -> Command {
        let mut cmd = Command::new(&self.cmake);
        cmd.arg("--build").arg(".").current_dir(&layout.build_dir);
        env.apply(&mut cmd);
        cmd
    }

    fn run_tool(&self, mut cmd: Command, step: &str) -> Result<i32> {
        let status = cmd
            .status()
            .with_context(|| format!("exec {} ({step})", self.cmake.display()))?;
        Ok(exit_code(status))
    }
}
