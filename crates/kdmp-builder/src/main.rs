use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use kdmp_matrix::build_driver::{DEFAULT_CMAKE, DEFAULT_GENERATOR};
use kdmp_matrix::config::config_path;
use kdmp_matrix::fetch::DEFAULT_FIXTURES_URL;
use kdmp_matrix::matrix::resolve_selection;
use kdmp_matrix::test_runner::DEFAULT_TEST_EXECUTABLE;
use kdmp_matrix::{
    Arch, ArtifactFetcher, BuildDriver, Config, Configuration, EnvironmentResolver, Orchestrator,
    Outcome, Platform, ProcessTools, Reporter, RunPlan, State, TestRunner,
};

#[derive(Debug, Parser)]
#[command(name = "kdmp-builder")]
#[command(about = "Build and test every kdmp-parser flavor.", long_about = None)]
#[command(version)]
struct Cli {
    /// Fetch the test dumps and run every flavor's testapp against them.
    #[arg(long)]
    run_tests: bool,

    /// Build configuration (repeatable; default: all).
    #[arg(long = "configuration", value_enum)]
    configurations: Vec<Configuration>,

    /// Target architecture (repeatable; default: all).
    #[arg(long = "arch", value_enum)]
    archs: Vec<Arch>,

    /// Reuse existing binaries instead of building.
    #[arg(long)]
    skip_build: bool,

    /// Source checkout holding CMakeLists.txt (default: current directory).
    #[arg(long)]
    root: Option<PathBuf>,

    /// Config file (default: <root>/kdmp-builder.json).
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    fixtures_url: Option<String>,

    #[arg(long)]
    quiet: bool,
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let reporter = Reporter::new(cli.quiet);

    let root = effective_root(cli.root.as_deref())?;
    let cfg = match &cli.config {
        Some(path) => Config::load_required(path)?,
        None => Config::load(&config_path(&root))?,
    };

    let selection = resolve_selection(&cli.archs, &cli.configurations, cli.skip_build)?;
    if selection.test.is_ci_override() {
        reporter.progress("CI detected, testing the injected flavor only");
    }
    let plan = RunPlan::from_selection(&selection, cli.run_tests);

    let mut tools = process_tools(&cli, &cfg, root, &reporter);
    let outcome = Orchestrator::new(plan, &mut tools, &reporter).run();
    Ok(report_outcome(&outcome))
}

fn effective_root(root: Option<&Path>) -> Result<PathBuf> {
    let root = match root {
        Some(root) => root.to_path_buf(),
        None => std::env::current_dir().context("current_dir")?,
    };
    std::path::absolute(&root).with_context(|| format!("absolute path of {}", root.display()))
}

fn process_tools<'a>(
    cli: &Cli,
    cfg: &Config,
    root: PathBuf,
    reporter: &'a Reporter,
) -> ProcessTools<'a> {
    let platform = Platform::host();

    let driver = BuildDriver {
        root: root.clone(),
        source_root: root.clone(),
        platform,
        cmake: cfg
            .cmake
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CMAKE)),
        generator: cfg
            .generator
            .clone()
            .unwrap_or_else(|| DEFAULT_GENERATOR.to_string()),
        resolver: EnvironmentResolver::for_platform(platform, cfg.setup_script.clone()),
    };

    let url = cli
        .fixtures_url
        .clone()
        .or_else(|| cfg.fixtures_url.clone())
        .unwrap_or_else(|| DEFAULT_FIXTURES_URL.to_string());
    let download_dir = cfg
        .download_dir
        .clone()
        .unwrap_or_else(ArtifactFetcher::default_download_dir);
    let mut fetcher = ArtifactFetcher::new(url, download_dir);
    fetcher.expected_sha256 = cfg.fixtures_sha256.clone();
    if !cfg.fixtures.is_empty() {
        fetcher.fixture_names = cfg.fixtures.clone();
    }

    let runner = TestRunner {
        root,
        platform,
        executable: cfg
            .test_executable
            .clone()
            .unwrap_or_else(|| DEFAULT_TEST_EXECUTABLE.to_string()),
    };

    ProcessTools {
        driver,
        fetcher,
        runner,
        reporter,
    }
}

fn report_outcome(outcome: &Outcome) -> ExitCode {
    match &outcome.state {
        State::Done => println!("ok: all good ({} steps)", outcome.results.len()),
        State::Failed(failure) => {
            println!("error: {}: {failure}", failure.code());
            if let Some(hint) = failure.hint() {
                println!("hint: {hint}");
            }
        }
        _ => {}
    }
    ExitCode::from(outcome.exit_code())
}
