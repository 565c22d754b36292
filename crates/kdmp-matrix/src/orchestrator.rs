use std::fmt;
use std::path::PathBuf;

use anyhow::Result;

use crate::build_driver::BuildDriver;
use crate::fetch::{ArtifactFetcher, Fixture};
use crate::matrix::{MatrixCell, MatrixSelection};
use crate::report::Reporter;
use crate::test_runner::TestRunner;

/// The side effects a run is made of. `ProcessTools` spawns the real tools.
pub trait MatrixTools {
    fn build(&mut self, cell: MatrixCell) -> Result<i32>;
    fn fetch_fixtures(&mut self) -> Result<Vec<Fixture>>;
    fn test(&mut self, cell: MatrixCell, fixture: &Fixture) -> Result<i32>;
    fn remove_fixture(&mut self, fixture: &Fixture) -> Result<()>;
}

pub struct ProcessTools<'a> {
    pub driver: BuildDriver,
    pub fetcher: ArtifactFetcher,
    pub runner: TestRunner,
    pub reporter: &'a Reporter,
}

impl MatrixTools for ProcessTools<'_> {
    fn build(&mut self, cell: MatrixCell) -> Result<i32> {
        self.driver.build(cell, self.reporter)
    }

    fn fetch_fixtures(&mut self) -> Result<Vec<Fixture>> {
        self.fetcher.fetch(self.reporter)
    }

    fn test(&mut self, cell: MatrixCell, fixture: &Fixture) -> Result<i32> {
        self.runner.run(cell, &fixture.local_path, self.reporter)
    }

    fn remove_fixture(&mut self, fixture: &Fixture) -> Result<()> {
        fixture.remove()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    /// Empty when the build phase is skipped.
    pub build: Vec<MatrixCell>,
    pub run_tests: bool,
    pub test: Vec<MatrixCell>,
}

impl RunPlan {
    pub fn from_selection(selection: &MatrixSelection, run_tests: bool) -> Self {
        Self {
            build: selection
                .build
                .as_ref()
                .map(|spec| spec.cells())
                .unwrap_or_default(),
            run_tests,
            test: selection.test.cells(),
        }
    }
}

/// Journal code for a tool that could not be started, same as a signal death.
pub const SPAWN_FAILED: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    ExitCode(i32),
    Error(String),
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::ExitCode(code) => write!(f, "exit code {code}"),
            Reason::Error(msg) => f.write_str(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    Build {
        cell: MatrixCell,
        reason: Reason,
    },
    Transfer {
        message: String,
    },
    Test {
        cell: MatrixCell,
        fixture: String,
        path: PathBuf,
        reason: Reason,
    },
    Cleanup {
        fixture: String,
        message: String,
    },
}

impl Failure {
    pub fn code(&self) -> &'static str {
        match self {
            Failure::Build { .. } => "BUILD_FAILED",
            Failure::Transfer { .. } => "TRANSFER_FAILED",
            Failure::Test { .. } => "TEST_FAILED",
            Failure::Cleanup { .. } => "CLEANUP_FAILED",
        }
    }

    pub fn hint(&self) -> Option<String> {
        match self {
            Failure::Test { path, .. } => {
                Some(format!("fixture kept for inspection: {}", path.display()))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Build { cell, reason } => {
                write!(f, "{cell} build failed ({reason}), bailing")
            }
            Failure::Transfer { message } => write!(f, "fetching fixtures failed: {message}"),
            Failure::Test {
                cell,
                fixture,
                reason,
                ..
            } => write!(f, "{cell}/{fixture} test failed ({reason}), bailing"),
            Failure::Cleanup { fixture, message } => {
                write!(f, "removing fixture {fixture} failed: {message}")
            }
        }
    }
}

impl std::error::Error for Failure {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    BuildMatrix { next: usize },
    FetchFixtures,
    TestMatrix { fixture: usize, next: usize },
    Cleanup { fixture: usize },
    Done,
    Failed(Failure),
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Done | State::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Build,
    Test,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixResult {
    pub cell: MatrixCell,
    pub phase: Phase,
    pub fixture: Option<String>,
    pub exit_code: i32,
}

#[derive(Debug)]
pub struct Outcome {
    pub state: State,
    pub results: Vec<MatrixResult>,
}

impl Outcome {
    pub fn failure(&self) -> Option<&Failure> {
        match &self.state {
            State::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self.state {
            State::Done => 0,
            _ => 1,
        }
    }
}

/// Sequences build, fetch, test and cleanup, stopping at the first failure.
///
/// A fixture is removed only once every test cell ran cleanly against it;
/// the fixture a test failed on stays on disk.
pub struct Orchestrator<'a, T: MatrixTools> {
    plan: RunPlan,
    tools: &'a mut T,
    reporter: &'a Reporter,
    state: State,
    fixtures: Vec<Fixture>,
    results: Vec<MatrixResult>,
}

impl<'a, T: MatrixTools> Orchestrator<'a, T> {
    pub fn new(plan: RunPlan, tools: &'a mut T, reporter: &'a Reporter) -> Self {
        Self {
            plan,
            tools,
            reporter,
            state: State::BuildMatrix { next: 0 },
            fixtures: Vec::new(),
            results: Vec::new(),
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn run(mut self) -> Outcome {
        while !self.state.is_terminal() {
            self.step();
        }
        Outcome {
            state: self.state,
            results: self.results,
        }
    }

    /// Performs exactly one transition.
    pub fn step(&mut self) -> &State {
        let next = match std::mem::replace(&mut self.state, State::Done) {
            State::BuildMatrix { next } => self.build_cell(next),
            State::FetchFixtures => self.fetch(),
            State::TestMatrix { fixture, next } => self.test_cell(fixture, next),
            State::Cleanup { fixture } => self.cleanup(fixture),
            terminal => terminal,
        };
        self.state = next;
        &self.state
    }

    fn build_cell(&mut self, idx: usize) -> State {
        let Some(&cell) = self.plan.build.get(idx) else {
            return self.after_build();
        };
        match self.tools.build(cell) {
            Ok(0) => {
                self.record(cell, Phase::Build, None, 0);
                State::BuildMatrix { next: idx + 1 }
            }
            Ok(code) => {
                self.record(cell, Phase::Build, None, code);
                State::Failed(Failure::Build {
                    cell,
                    reason: Reason::ExitCode(code),
                })
            }
            Err(err) => {
                self.record(cell, Phase::Build, None, SPAWN_FAILED);
                State::Failed(Failure::Build {
                    cell,
                    reason: Reason::Error(format!("{err:#}")),
                })
            }
        }
    }

    fn after_build(&mut self) -> State {
        if !self.plan.run_tests {
            return State::Done;
        }
        if self.plan.test.is_empty() {
            self.reporter.progress("test matrix is empty, nothing to run");
            return State::Done;
        }
        State::FetchFixtures
    }

    fn fetch(&mut self) -> State {
        match self.tools.fetch_fixtures() {
            Ok(fixtures) if fixtures.is_empty() => State::Done,
            Ok(fixtures) => {
                self.fixtures = fixtures;
                State::TestMatrix {
                    fixture: 0,
                    next: 0,
                }
            }
            Err(err) => State::Failed(Failure::Transfer {
                message: format!("{err:#}"),
            }),
        }
    }

    fn test_cell(&mut self, fixture_idx: usize, idx: usize) -> State {
        let Some(&cell) = self.plan.test.get(idx) else {
            return State::Cleanup {
                fixture: fixture_idx,
            };
        };
        let fixture = self.fixtures[fixture_idx].clone();
        let reason = match self.tools.test(cell, &fixture) {
            Ok(0) => {
                self.record(cell, Phase::Test, Some(&fixture.name), 0);
                return State::TestMatrix {
                    fixture: fixture_idx,
                    next: idx + 1,
                };
            }
            Ok(code) => {
                self.record(cell, Phase::Test, Some(&fixture.name), code);
                Reason::ExitCode(code)
            }
            Err(err) => {
                self.record(cell, Phase::Test, Some(&fixture.name), SPAWN_FAILED);
                Reason::Error(format!("{err:#}"))
            }
        };
        State::Failed(Failure::Test {
            cell,
            fixture: fixture.name,
            path: fixture.local_path,
            reason,
        })
    }

    fn cleanup(&mut self, fixture_idx: usize) -> State {
        let fixture = &self.fixtures[fixture_idx];
        if let Err(err) = self.tools.remove_fixture(fixture) {
            return State::Failed(Failure::Cleanup {
                fixture: fixture.name.clone(),
                message: format!("{err:#}"),
            });
        }
        self.reporter
            .progress(&format!("{} exercised by every flavor, removed", fixture.name));
        if fixture_idx + 1 < self.fixtures.len() {
            State::TestMatrix {
                fixture: fixture_idx + 1,
                next: 0,
            }
        } else {
            State::Done
        }
    }

    fn record(&mut self, cell: MatrixCell, phase: Phase, fixture: Option<&str>, exit_code: i32) {
        self.results.push(MatrixResult {
            cell,
            phase,
            fixture: fixture.map(str::to_string),
            exit_code,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use anyhow::anyhow;

    use super::*;
    use crate::matrix::{generate, Arch, Configuration};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Build(MatrixCell),
        Fetch,
        Test(MatrixCell, String),
        Remove(String),
    }

    /// Fixtures are kept in an in-memory "disk" so lifecycle can be checked.
    #[derive(Default)]
    struct FakeTools {
        calls: Vec<Call>,
        build_codes: BTreeMap<usize, i32>,
        test_fail: Option<(MatrixCell, &'static str, i32)>,
        fetch_error: bool,
        build_error: Option<usize>,
        test_error: Option<(MatrixCell, &'static str)>,
        remove_error: Option<&'static str>,
        on_disk: Vec<String>,
        present_during_tests: bool,
    }

    impl FakeTools {
        fn new() -> Self {
            Self {
                present_during_tests: true,
                ..Self::default()
            }
        }

        fn builds(&self) -> usize {
            self.calls
                .iter()
                .filter(|c| matches!(c, Call::Build(_)))
                .count()
        }

        fn tests(&self) -> usize {
            self.calls
                .iter()
                .filter(|c| matches!(c, Call::Test(..)))
                .count()
        }
    }

    impl MatrixTools for FakeTools {
        fn build(&mut self, cell: MatrixCell) -> Result<i32> {
            let idx = self.builds();
            self.calls.push(Call::Build(cell));
            if self.build_error == Some(idx) {
                return Err(anyhow!("exec cmake (configure): No such file or directory"));
            }
            Ok(self.build_codes.get(&idx).copied().unwrap_or(0))
        }

        fn fetch_fixtures(&mut self) -> Result<Vec<Fixture>> {
            self.calls.push(Call::Fetch);
            if self.fetch_error {
                return Err(anyhow!("GET http://fixtures/testdatas.zip: connection refused"));
            }
            self.on_disk = vec!["full.dmp".to_string(), "bmp.dmp".to_string()];
            Ok(self
                .on_disk
                .iter()
                .map(|name| Fixture {
                    name: name.clone(),
                    local_path: PathBuf::from("/tmp/fixtures").join(name),
                })
                .collect())
        }

        fn test(&mut self, cell: MatrixCell, fixture: &Fixture) -> Result<i32> {
            self.present_during_tests &= self.on_disk.contains(&fixture.name);
            self.calls.push(Call::Test(cell, fixture.name.clone()));
            if let Some((c, name)) = self.test_error {
                if c == cell && name == fixture.name {
                    return Err(anyhow!("exec testapp: No such file or directory"));
                }
            }
            match self.test_fail {
                Some((c, name, code)) if c == cell && name == fixture.name => Ok(code),
                _ => Ok(0),
            }
        }

        fn remove_fixture(&mut self, fixture: &Fixture) -> Result<()> {
            self.calls.push(Call::Remove(fixture.name.clone()));
            if self.remove_error == Some(fixture.name.as_str()) {
                return Err(anyhow!("remove {}: Permission denied", fixture.name));
            }
            self.on_disk.retain(|n| n != &fixture.name);
            Ok(())
        }
    }

    fn plan(archs: &[Arch], cfgs: &[Configuration], run_tests: bool) -> RunPlan {
        let cells = generate(archs, cfgs);
        RunPlan {
            build: cells.clone(),
            run_tests,
            test: cells,
        }
    }

    fn quiet() -> Reporter {
        Reporter::new(true)
    }

    #[test]
    fn single_build_without_tests_succeeds() {
        let mut tools = FakeTools::new();
        let reporter = quiet();
        let outcome = Orchestrator::new(
            plan(&[Arch::X64], &[Configuration::Debug], false),
            &mut tools,
            &reporter,
        )
        .run();
        assert_eq!(outcome.state, State::Done);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(
            tools.calls,
            vec![Call::Build(MatrixCell::new(Arch::X64, Configuration::Debug))]
        );
    }

    #[test]
    fn build_failure_stops_remaining_cells_and_phases() {
        let all = plan(&Arch::ALL, &Configuration::ALL, true);
        for k in 0..all.build.len() {
            let mut tools = FakeTools::new();
            tools.build_codes.insert(k, 2);
            let reporter = quiet();
            let outcome = Orchestrator::new(all.clone(), &mut tools, &reporter).run();

            assert_eq!(outcome.exit_code(), 1);
            assert_eq!(tools.builds(), k + 1);
            assert!(!tools.calls.contains(&Call::Fetch));
            assert_eq!(tools.tests(), 0);
            assert_eq!(
                outcome.failure(),
                Some(&Failure::Build {
                    cell: all.build[k],
                    reason: Reason::ExitCode(2),
                })
            );
        }
    }

    #[test]
    fn full_run_tests_every_cell_then_removes_each_fixture() {
        let mut tools = FakeTools::new();
        let reporter = quiet();
        let p = plan(
            &[Arch::X64, Arch::X86],
            &[Configuration::Debug, Configuration::Release],
            true,
        );
        let outcome = Orchestrator::new(p.clone(), &mut tools, &reporter).run();

        assert_eq!(outcome.state, State::Done);
        assert_eq!(tools.builds(), 4);
        assert_eq!(tools.tests(), 8);
        assert!(tools.present_during_tests);
        assert!(tools.on_disk.is_empty());

        let mut expected: Vec<Call> = p.build.iter().map(|c| Call::Build(*c)).collect();
        expected.push(Call::Fetch);
        for name in ["full.dmp", "bmp.dmp"] {
            expected.extend(p.test.iter().map(|c| Call::Test(*c, name.to_string())));
            expected.push(Call::Remove(name.to_string()));
        }
        assert_eq!(tools.calls, expected);
        assert_eq!(outcome.results.len(), 12);
        assert!(outcome.results.iter().all(|r| r.exit_code == 0));
    }

    #[test]
    fn test_failure_keeps_current_fixture() {
        let mut tools = FakeTools::new();
        let failing = MatrixCell::new(Arch::X86, Configuration::Debug);
        tools.test_fail = Some((failing, "bmp.dmp", 1));
        let reporter = quiet();
        let outcome = Orchestrator::new(
            plan(
                &[Arch::X64, Arch::X86],
                &[Configuration::Debug, Configuration::Release],
                true,
            ),
            &mut tools,
            &reporter,
        )
        .run();

        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(tools.on_disk, vec!["bmp.dmp".to_string()]);
        assert_eq!(tools.calls.last(), Some(&Call::Test(failing, "bmp.dmp".to_string())));
        // 4 cells against full.dmp, then x64/Debug, x64/Release, x86/Debug.
        assert_eq!(tools.tests(), 7);
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.code(), "TEST_FAILED");
        assert_eq!(failure.to_string(), "x86/Debug/bmp.dmp test failed (exit code 1), bailing");
        assert!(failure.hint().unwrap().contains("bmp.dmp"));
    }

    #[test]
    fn fetch_failure_runs_no_tests() {
        let mut tools = FakeTools::new();
        tools.fetch_error = true;
        let reporter = quiet();
        let outcome = Orchestrator::new(
            plan(&[Arch::X64], &[Configuration::Debug], true),
            &mut tools,
            &reporter,
        )
        .run();
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(tools.tests(), 0);
        assert_eq!(outcome.failure().unwrap().code(), "TRANSFER_FAILED");
        assert!(outcome.failure().unwrap().to_string().contains("connection refused"));
    }

    #[test]
    fn skipped_build_goes_straight_to_fetch() {
        let mut tools = FakeTools::new();
        let reporter = quiet();
        let mut p = plan(&Arch::ALL, &[Configuration::Release], true);
        p.build.clear();
        let mut orch = Orchestrator::new(p, &mut tools, &reporter);
        assert_eq!(orch.step(), &State::FetchFixtures);
        assert_eq!(
            orch.step(),
            &State::TestMatrix {
                fixture: 0,
                next: 0
            }
        );
        let outcome = orch.run();
        assert_eq!(outcome.state, State::Done);
        assert_eq!(tools.builds(), 0);
    }

    #[test]
    fn empty_test_matrix_is_a_no_op() {
        let mut tools = FakeTools::new();
        let reporter = quiet();
        let p = RunPlan {
            build: Vec::new(),
            run_tests: true,
            test: Vec::new(),
        };
        let outcome = Orchestrator::new(p, &mut tools, &reporter).run();
        assert_eq!(outcome.state, State::Done);
        assert!(tools.calls.is_empty());
    }

    #[test]
    fn build_spawn_error_is_terminal_and_journaled() {
        let mut tools = FakeTools::new();
        tools.build_error = Some(1);
        let reporter = quiet();
        let p = plan(&[Arch::X64, Arch::X86], &[Configuration::Debug], true);
        let outcome = Orchestrator::new(p.clone(), &mut tools, &reporter).run();

        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(tools.builds(), 2);
        assert!(!tools.calls.contains(&Call::Fetch));
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.code(), "BUILD_FAILED");
        match failure {
            Failure::Build {
                cell,
                reason: Reason::Error(msg),
            } => {
                assert_eq!(*cell, p.build[1]);
                assert!(msg.contains("No such file"), "{msg}");
            }
            other => panic!("unexpected failure: {other:?}"),
        }
        assert_eq!(
            outcome.results.last(),
            Some(&MatrixResult {
                cell: p.build[1],
                phase: Phase::Build,
                fixture: None,
                exit_code: SPAWN_FAILED,
            })
        );
    }

    #[test]
    fn test_spawn_error_keeps_fixture_and_stops() {
        let mut tools = FakeTools::new();
        let missing = MatrixCell::new(Arch::X64, Configuration::Release);
        tools.test_error = Some((missing, "full.dmp"));
        let reporter = quiet();
        let p = plan(&Arch::ALL, &[Configuration::Debug, Configuration::Release], true);
        let outcome = Orchestrator::new(p, &mut tools, &reporter).run();

        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(tools.tests(), 2);
        assert_eq!(tools.calls.last(), Some(&Call::Test(missing, "full.dmp".to_string())));
        assert!(!tools.calls.iter().any(|c| matches!(c, Call::Remove(_))));
        assert!(tools.on_disk.contains(&"full.dmp".to_string()));
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.code(), "TEST_FAILED");
        assert!(matches!(
            failure,
            Failure::Test {
                reason: Reason::Error(_),
                ..
            }
        ));
        assert!(failure.hint().unwrap().contains("full.dmp"));
        let last = outcome.results.last().unwrap();
        assert_eq!(last.cell, missing);
        assert_eq!(last.phase, Phase::Test);
        assert_eq!(last.fixture.as_deref(), Some("full.dmp"));
        assert_eq!(last.exit_code, SPAWN_FAILED);
    }

    #[test]
    fn cleanup_error_is_terminal() {
        let mut tools = FakeTools::new();
        tools.remove_error = Some("full.dmp");
        let reporter = quiet();
        let p = plan(&[Arch::X64], &[Configuration::Debug], true);
        let outcome = Orchestrator::new(p, &mut tools, &reporter).run();

        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(
            outcome.failure(),
            Some(&Failure::Cleanup {
                fixture: "full.dmp".to_string(),
                message: "remove full.dmp: Permission denied".to_string(),
            })
        );
        assert_eq!(outcome.failure().unwrap().code(), "CLEANUP_FAILED");
        // bmp.dmp is never tested once cleanup of full.dmp failed.
        assert_eq!(tools.tests(), 1);
        assert_eq!(tools.calls.last(), Some(&Call::Remove("full.dmp".to_string())));
        assert_eq!(tools.on_disk, vec!["full.dmp".to_string(), "bmp.dmp".to_string()]);
    }

    #[test]
    fn terminal_states_do_not_move() {
        let mut tools = FakeTools::new();
        let reporter = quiet();
        let p = plan(&[Arch::X64], &[Configuration::Debug], false);
        let mut orch = Orchestrator::new(p, &mut tools, &reporter);
        while !orch.state().is_terminal() {
            orch.step();
        }
        assert_eq!(orch.step(), &State::Done);
        assert_eq!(orch.step(), &State::Done);
    }
}
