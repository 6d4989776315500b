//! Test-case detection and timeout budgets.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mtest_core::{ClientKind, MtestError, Requirements, RunConfig};
use tracing::warn;

use crate::error::{RunnerError, RunnerResult};
use crate::supervisor::{LaunchSpec, StdinSource};

/// How a test is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestKind {
    /// `<name>.sql` fed to the SQL client.
    SqlInput,
    /// `<name>.malC` fed to the MAL client.
    MalInput,
    /// A python program run by the python client.
    Python,
    /// A shell script or executable run directly.
    Script,
}

impl TestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TestKind::SqlInput => "sql",
            TestKind::MalInput => "mal",
            TestKind::Python => "python",
            TestKind::Script => "script",
        }
    }

    /// Whether the harness cannot see the processes the test starts itself,
    /// so crashes must be looked for in its output.
    pub fn is_opaque(self) -> bool {
        matches!(self, TestKind::Python | TestKind::Script)
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which server a test needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    Sql,
    Mal,
}

/// One runnable test found in a directory.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub dir: PathBuf,
    pub name: String,
    pub kind: TestKind,
    pub server: Option<ServerKind>,
    /// The file that is executed or fed to the client.
    pub source: PathBuf,
}

/// Suffixes probed in order, with the kind and server they imply.
const LAYOUTS: [(&str, TestKind, Option<ServerKind>, bool); 11] = [
    (".sql", TestKind::SqlInput, Some(ServerKind::Sql), false),
    (".malC", TestKind::MalInput, Some(ServerKind::Mal), false),
    (".SQL.py", TestKind::Python, Some(ServerKind::Sql), false),
    (".MAL.py", TestKind::Python, Some(ServerKind::Mal), false),
    (".py", TestKind::Python, None, false),
    (".SQL.sh", TestKind::Script, Some(ServerKind::Sql), true),
    (".MAL.sh", TestKind::Script, Some(ServerKind::Mal), true),
    (".SQL", TestKind::Script, Some(ServerKind::Sql), true),
    (".MAL", TestKind::Script, Some(ServerKind::Mal), true),
    (".sh", TestKind::Script, None, true),
    ("", TestKind::Script, None, true),
];

impl TestCase {
    /// Find the source of test `name` in `dir`.
    ///
    /// The last three columns of the layout table decide the kind, the
    /// server and whether the file must be executable. `None` when no
    /// layout matches.
    pub fn detect(dir: &Path, name: &str) -> RunnerResult<Option<Self>> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(MtestError::InvalidTestName(name.to_string()).into());
        }
        for (suffix, kind, server, needs_exec) in LAYOUTS {
            let source = dir.join(format!("{name}{suffix}"));
            if !source.is_file() || (needs_exec && !is_executable(&source)) {
                continue;
            }
            return Ok(Some(TestCase {
                dir: dir.to_path_buf(),
                name: name.to_string(),
                kind,
                server,
                source,
            }));
        }
        Ok(None)
    }

    pub fn requirements(&self) -> Requirements {
        Requirements {
            client: match self.kind {
                TestKind::SqlInput => Some(ClientKind::Sql),
                TestKind::MalInput => Some(ClientKind::Mal),
                TestKind::Python => Some(ClientKind::Python),
                TestKind::Script => None,
            },
            sql_server: self.server == Some(ServerKind::Sql),
        }
    }

    pub fn needs_server(&self) -> bool {
        self.server.is_some()
    }

    /// Path of a per-test file: `<dir>/<name><suffix>`.
    pub fn file(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{suffix}", self.name))
    }

    /// Launch spec of the client step talking to a server on `port`.
    pub fn client_spec(&self, config: &RunConfig, port: u16) -> RunnerResult<LaunchSpec> {
        let client = |kind: ClientKind| {
            config.client(kind).ok_or_else(|| {
                RunnerError::from(MtestError::InvalidConfig(format!(
                    "no {kind:?} client configured"
                )))
            })
        };
        let spec = match self.kind {
            TestKind::SqlInput => LaunchSpec::from_template(client(ClientKind::Sql)?)?
                .arg(format!("--port={port}"))
                .stdin(StdinSource::File(self.source.clone())),
            TestKind::MalInput => LaunchSpec::from_template(client(ClientKind::Mal)?)?
                .arg(format!("--port={port}"))
                .stdin(StdinSource::File(self.source.clone())),
            TestKind::Python => LaunchSpec::from_template(client(ClientKind::Python)?)?
                .arg(self.source.display().to_string()),
            TestKind::Script => LaunchSpec::new([self.source.display().to_string()])?,
        };
        Ok(spec
            .cwd(&self.dir)
            .env("MAPIPORT", port.to_string())
            .env("TSTDB", config.server.db_name.clone())
            .env("TST", self.name.clone())
            .env("TSTSRCDIR", self.dir.display().to_string())
            .process_group(config.process_groups))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).map_or(false, |m| m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Timeouts of one test, derived from the base timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutBudget {
    /// Base timeout scaled by the test's factor.
    pub scaled: Duration,
    /// Client step.
    pub client: Duration,
    /// Whole server lifetime.
    pub server: Duration,
}

impl TimeoutBudget {
    /// Compute the budget; a zero base disables every timeout.
    pub fn compute(base_secs: u64, factor: f64, kind: TestKind, server: bool) -> Self {
        let mut scaled = if factor > 0.0 {
            (base_secs as f64 * factor) as u64
        } else {
            base_secs
        };
        if scaled < 1 && base_secs > 0 {
            scaled = 1;
        }

        let mut client = match kind {
            TestKind::Script | TestKind::Python => scaled.min(base_secs),
            // one input file, one scaled budget
            TestKind::SqlInput | TestKind::MalInput => scaled,
        };
        client = client.max(scaled);

        let mut server_secs = client;
        if server && scaled > 0 {
            server_secs += scaled + scaled.min(base_secs);
        }

        Self {
            scaled: Duration::from_secs(scaled),
            client: Duration::from_secs(client),
            server: Duration::from_secs(server_secs),
        }
    }

    /// Budget for `case`, reading its `.timeout` factor file when present.
    pub fn for_case(base_secs: u64, case: &TestCase) -> RunnerResult<Self> {
        let factor = read_timeout_factor(&case.file(".timeout"))?;
        Ok(Self::compute(base_secs, factor, case.kind, case.needs_server()))
    }
}

/// Timeout factor from a `.timeout` file; 1 when absent or unreadable.
fn read_timeout_factor(path: &Path) -> RunnerResult<f64> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(1.0),
        Err(e) => return Err(e.into()),
    };
    match text.trim().parse::<f64>() {
        Ok(f) if f > 0.0 => Ok(f),
        _ => {
            warn!(path = %path.display(), contents = %text.trim(), "ignoring invalid timeout factor");
            Ok(1.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[cfg(unix)]
    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_detect_sql_before_script() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("t.sql"), "select 1;\n").unwrap();
        fs::write(dir.path().join("t.sh"), "#!/bin/sh\n").unwrap();
        let case = TestCase::detect(dir.path(), "t").unwrap().unwrap();
        assert_eq!(case.kind, TestKind::SqlInput);
        assert_eq!(case.server, Some(ServerKind::Sql));
        assert!(case.requirements().sql_server);
        assert_eq!(case.requirements().client, Some(ClientKind::Sql));
    }

    #[test]
    fn test_detect_python_with_mal_server() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("t.MAL.py"), "print(1)\n").unwrap();
        let case = TestCase::detect(dir.path(), "t").unwrap().unwrap();
        assert_eq!(case.kind, TestKind::Python);
        assert_eq!(case.server, Some(ServerKind::Mal));
        assert!(!case.requirements().sql_server);
    }

    #[cfg(unix)]
    #[test]
    fn test_script_must_be_executable() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("t.SQL.sh");
        fs::write(&script, "#!/bin/sh\necho hi\n").unwrap();
        assert!(TestCase::detect(dir.path(), "t").unwrap().is_none());
        make_executable(&script);
        let case = TestCase::detect(dir.path(), "t").unwrap().unwrap();
        assert_eq!(case.kind, TestKind::Script);
        assert_eq!(case.server, Some(ServerKind::Sql));
        assert!(case.kind.is_opaque());
    }

    #[test]
    fn test_missing_and_invalid_names() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TestCase::detect(dir.path(), "nothing").unwrap().is_none());
        assert!(matches!(
            TestCase::detect(dir.path(), "a/b"),
            Err(RunnerError::Core(MtestError::InvalidTestName(_)))
        ));
    }

    #[test]
    fn test_client_spec_for_sql_input() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("t.sql"), "select 1;\n").unwrap();
        let case = TestCase::detect(dir.path(), "t").unwrap().unwrap();
        let spec = case.client_spec(&RunConfig::default(), 31000).unwrap();
        assert_eq!(spec.program, "mclient");
        assert!(spec.args.contains(&"--port=31000".to_string()));
        assert!(matches!(spec.stdin, StdinSource::File(_)));
        assert!(spec.env.contains(&("MAPIPORT".to_string(), "31000".to_string())));
    }

    #[test]
    fn test_budget_without_factor() {
        let b = TimeoutBudget::compute(60, 1.0, TestKind::SqlInput, true);
        assert_eq!(b.scaled, Duration::from_secs(60));
        assert_eq!(b.client, Duration::from_secs(60));
        assert_eq!(b.server, Duration::from_secs(180));

        let b = TimeoutBudget::compute(60, 1.0, TestKind::Script, false);
        assert_eq!(b.server, b.client);
    }

    #[test]
    fn test_budget_scaling() {
        let b = TimeoutBudget::compute(60, 2.0, TestKind::Script, true);
        assert_eq!(b.scaled, Duration::from_secs(120));
        // at least the scaled value
        assert_eq!(b.client, Duration::from_secs(120));
        assert_eq!(b.server, Duration::from_secs(120 + 120 + 60));

        let b = TimeoutBudget::compute(1, 0.1, TestKind::Script, false);
        assert_eq!(b.scaled, Duration::from_secs(1));
    }

    #[test]
    fn test_zero_base_disables_everything() {
        let b = TimeoutBudget::compute(0, 3.0, TestKind::SqlInput, true);
        assert_eq!(b.scaled, Duration::ZERO);
        assert_eq!(b.client, Duration::ZERO);
        assert_eq!(b.server, Duration::ZERO);
    }

    #[test]
    fn test_timeout_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("t.sql"), "").unwrap();
        fs::write(dir.path().join("t.timeout"), "3\n").unwrap();
        let case = TestCase::detect(dir.path(), "t").unwrap().unwrap();
        let b = TimeoutBudget::for_case(10, &case).unwrap();
        assert_eq!(b.scaled, Duration::from_secs(30));

        fs::write(dir.path().join("t.timeout"), "bogus\n").unwrap();
        let b = TimeoutBudget::for_case(10, &case).unwrap();
        assert_eq!(b.scaled, Duration::from_secs(10));
    }
}
