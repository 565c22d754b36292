use std::fmt;
use std::str::FromStr;

pub const ENV_CI: &str = "CI";
pub const ENV_CI_ARCH: &str = "KDMP_BUILDER_ARCH";
pub const ENV_CI_CONFIGURATION: &str = "KDMP_BUILDER_CONFIGURATION";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Arch {
    X64,
    X86,
}

impl Arch {
    pub const ALL: [Arch; 2] = [Arch::X64, Arch::X86];

    pub fn as_str(self) -> &'static str {
        match self {
            Arch::X64 => "x64",
            Arch::X86 => "x86",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Configuration {
    Debug,
    Release,
    RelWithDebInfo,
}

impl Configuration {
    pub const ALL: [Configuration; 3] = [
        Configuration::Debug,
        Configuration::Release,
        Configuration::RelWithDebInfo,
    ];

    /// Name handed to `CMAKE_BUILD_TYPE` and used in directory names.
    pub fn as_str(self) -> &'static str {
        match self {
            Configuration::Debug => "Debug",
            Configuration::Release => "Release",
            Configuration::RelWithDebInfo => "RelWithDebInfo",
        }
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct MatrixParseError {
    what: &'static str,
    value: String,
    expected: &'static str,
}

impl fmt::Display for MatrixParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid {} {:?} (expected one of: {})",
            self.what, self.value, self.expected
        )
    }
}

impl std::error::Error for MatrixParseError {}

impl FromStr for Arch {
    type Err = MatrixParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x64" => Ok(Arch::X64),
            "x86" => Ok(Arch::X86),
            _ => Err(MatrixParseError {
                what: "architecture",
                value: s.trim().to_string(),
                expected: "x64, x86",
            }),
        }
    }
}

impl FromStr for Configuration {
    type Err = MatrixParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Configuration::Debug),
            "release" => Ok(Configuration::Release),
            "relwithdebinfo" => Ok(Configuration::RelWithDebInfo),
            _ => Err(MatrixParseError {
                what: "configuration",
                value: s.trim().to_string(),
                expected: "Debug, Release, RelWithDebInfo",
            }),
        }
    }
}

#[cfg(feature = "clap")]
impl clap::ValueEnum for Arch {
    fn value_variants<'a>() -> &'a [Self] {
        &Arch::ALL
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }
}

#[cfg(feature = "clap")]
impl clap::ValueEnum for Configuration {
    fn value_variants<'a>() -> &'a [Self] {
        &Configuration::ALL
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }
}

/// One `(architecture, configuration)` flavor of the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatrixCell {
    pub arch: Arch,
    pub configuration: Configuration,
}

impl MatrixCell {
    pub fn new(arch: Arch, configuration: Configuration) -> Self {
        Self {
            arch,
            configuration,
        }
    }
}

impl fmt::Display for MatrixCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.arch, self.configuration)
    }
}

/// Cartesian product, architectures outer and configurations inner.
///
/// Repeated selectors are dropped after their first occurrence so every cell
/// is unique. Either side being empty yields an empty matrix.
pub fn generate(archs: &[Arch], configurations: &[Configuration]) -> Vec<MatrixCell> {
    let archs = dedup(archs);
    let configurations = dedup(configurations);
    let mut out = Vec::with_capacity(archs.len() * configurations.len());
    for &arch in &archs {
        for &configuration in &configurations {
            out.push(MatrixCell::new(arch, configuration));
        }
    }
    out
}

fn dedup<T: Copy + PartialEq>(items: &[T]) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for &item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatrixSpec {
    FullMatrix {
        archs: Vec<Arch>,
        configurations: Vec<Configuration>,
    },
    SingleCell(MatrixCell),
}

impl MatrixSpec {
    /// Full matrix over the selected values; an empty selection means every
    /// known value.
    pub fn full(archs: &[Arch], configurations: &[Configuration]) -> Self {
        let archs = if archs.is_empty() {
            Arch::ALL.to_vec()
        } else {
            archs.to_vec()
        };
        let configurations = if configurations.is_empty() {
            Configuration::ALL.to_vec()
        } else {
            configurations.to_vec()
        };
        MatrixSpec::FullMatrix {
            archs,
            configurations,
        }
    }

    pub fn cells(&self) -> Vec<MatrixCell> {
        match self {
            MatrixSpec::FullMatrix {
                archs,
                configurations,
            } => generate(archs, configurations),
            MatrixSpec::SingleCell(cell) => vec![*cell],
        }
    }

    pub fn is_ci_override(&self) -> bool {
        matches!(self, MatrixSpec::SingleCell(_))
    }
}

/// Matrix selection resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixSelection {
    /// Cells to build; `None` when the build phase is skipped.
    pub build: Option<MatrixSpec>,
    pub test: MatrixSpec,
}

#[derive(Debug, Clone, Default)]
pub struct CiEnv {
    pub indicator: Option<String>,
    pub arch: Option<String>,
    pub configuration: Option<String>,
}

impl CiEnv {
    pub fn from_process_env() -> Self {
        Self {
            indicator: std::env::var(ENV_CI).ok(),
            arch: std::env::var(ENV_CI_ARCH).ok(),
            configuration: std::env::var(ENV_CI_CONFIGURATION).ok(),
        }
    }

    pub fn is_ci(&self) -> bool {
        self.indicator
            .as_deref()
            .is_some_and(|v| !v.trim().is_empty())
    }
}

pub fn resolve_selection_with_env(
    archs: &[Arch],
    configurations: &[Configuration],
    skip_build: bool,
    ci: &CiEnv,
) -> anyhow::Result<MatrixSelection> {
    let full = MatrixSpec::full(archs, configurations);
    if !ci.is_ci() {
        return Ok(MatrixSelection {
            build: (!skip_build).then(|| full.clone()),
            test: full,
        });
    }

    let Some(raw_arch) = ci.arch.as_deref() else {
        anyhow::bail!("{ENV_CI} is set but {ENV_CI_ARCH} is missing");
    };
    let Some(raw_configuration) = ci.configuration.as_deref() else {
        anyhow::bail!("{ENV_CI} is set but {ENV_CI_CONFIGURATION} is missing");
    };
    let arch = Arch::from_str(raw_arch)
        .map_err(|err| anyhow::anyhow!("invalid environment variable {ENV_CI_ARCH}: {err}"))?;
    let configuration = Configuration::from_str(raw_configuration).map_err(|err| {
        anyhow::anyhow!("invalid environment variable {ENV_CI_CONFIGURATION}: {err}")
    })?;

    Ok(MatrixSelection {
        build: None,
        test: MatrixSpec::SingleCell(MatrixCell::new(arch, configuration)),
    })
}

pub fn resolve_selection(
    archs: &[Arch],
    configurations: &[Configuration],
    skip_build: bool,
) -> anyhow::Result<MatrixSelection> {
    resolve_selection_with_env(archs, configurations, skip_build, &CiEnv::from_process_env())
}
