use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

use crate::layout::Platform;
use crate::matrix::Arch;

pub const DEFAULT_VCVARSALL: &str = r"C:\Program Files (x86)\Microsoft Visual Studio\2019\Community\VC\Auxiliary\Build\vcvarsall.bat";

/// Variables a build child runs with. Never merged into this process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildEnvironment {
    vars: BTreeMap<String, String>,
}

impl BuildEnvironment {
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn ambient() -> Self {
        Self::from_vars(std::env::vars_os().map(|(k, v)| {
            (
                k.to_string_lossy().into_owned(),
                v.to_string_lossy().into_owned(),
            )
        }))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Replaces the child's environment with exactly these variables.
    pub fn apply(&self, cmd: &mut Command) {
        cmd.env_clear();
        cmd.envs(self.vars.iter());
    }
}

/// Parses a `KEY=VALUE` per line dump, as printed by `set` or `env`.
pub fn parse_env_dump(dump: &str) -> BuildEnvironment {
    let mut vars = BTreeMap::new();
    for line in dump.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), value.to_string());
    }
    BuildEnvironment { vars }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentResolver {
    /// The current process already exposes the toolchain.
    Ambient,
    /// A vendor activation script taking the architecture as its argument.
    SetupScript(PathBuf),
}

impl EnvironmentResolver {
    pub fn for_platform(platform: Platform, setup_script: Option<PathBuf>) -> Self {
        match (platform, setup_script) {
            (_, Some(script)) => EnvironmentResolver::SetupScript(script),
            (Platform::Windows, None) => {
                EnvironmentResolver::SetupScript(PathBuf::from(DEFAULT_VCVARSALL))
            }
            (Platform::Linux, None) => EnvironmentResolver::Ambient,
        }
    }

    /// Completeness is not checked here: a missing or failing script yields
    /// whatever it printed, and the build step surfaces the breakage.
    pub fn resolve(&self, arch: Arch) -> Result<BuildEnvironment> {
        match self {
            EnvironmentResolver::Ambient => Ok(BuildEnvironment::ambient()),
            EnvironmentResolver::SetupScript(script) => {
                let out = setup_script_command(script, arch)
                    .stdin(Stdio::null())
                    .stderr(Stdio::inherit())
                    .output()
                    .with_context(|| format!("exec setup script {}", script.display()))?;
                Ok(parse_env_dump(&String::from_utf8_lossy(&out.stdout)))
            }
        }
    }
}

#[cfg(windows)]
fn setup_script_command(script: &Path, arch: Arch) -> Command {
    use std::os::windows::process::CommandExt as _;

    let mut cmd = Command::new("cmd");
    cmd.raw_arg(format!(
        "/d /s /c \"\"{}\" {} & set\"",
        script.display(),
        arch
    ));
    cmd
}

#[cfg(not(windows))]
fn setup_script_command(script: &Path, arch: Arch) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg("script=\"$1\"; set -- \"$2\"; . \"$script\" >&2; env")
        .arg("sh")
        .arg(script)
        .arg(arch.as_str());
    cmd
}
