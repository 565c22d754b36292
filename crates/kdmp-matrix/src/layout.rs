use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::matrix::MatrixCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Linux,
}

impl Platform {
    pub fn host() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }

    pub fn dir_prefix(self) -> &'static str {
        match self {
            Platform::Windows => "",
            Platform::Linux => "lin",
        }
    }

    pub fn exe_name(self, stem: &str) -> String {
        match self {
            Platform::Windows => format!("{stem}.exe"),
            Platform::Linux => stem.to_string(),
        }
    }
}

/// `<prefix><arch>-<configuration>`, shared by the build and output trees.
pub fn flavor_dir_name(platform: Platform, cell: MatrixCell) -> String {
    format!(
        "{}{}-{}",
        platform.dir_prefix(),
        cell.arch,
        cell.configuration
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryLayout {
    pub build_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl DirectoryLayout {
    /// `root` is expected to be absolute; the output dir is handed to cmake
    /// as-is and a relative one would land inside the build tree.
    pub fn for_cell(root: &Path, platform: Platform, cell: MatrixCell) -> Self {
        let name = flavor_dir_name(platform, cell);
        Self {
            build_dir: root.join("build").join(&name),
            output_dir: root.join("bin").join(name),
        }
    }

    /// Creates both directories; existing ones are reused.
    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.build_dir, &self.output_dir] {
            if dir.is_dir() {
                continue;
            }
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create_dir_all {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn test_executable(&self, platform: Platform, stem: &str) -> PathBuf {
        self.output_dir.join(platform.exe_name(stem))
    }
}
