//! Typed run configuration.
//!
//! Loaded from JSON; every field has a default so an empty object is a valid
//! configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{MtestError, Result};

/// Top-level configuration of one harness run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Base per-test timeout in seconds; 0 disables timeouts.
    pub timeout_secs: u64,
    /// Initial accuracy handed to the diff tool.
    pub accuracy: i32,
    /// Context lines in diff reports.
    pub diff_context: u32,
    /// Lines matching this regex are ignored by the diff tool.
    pub diff_ignore: String,
    pub ports: PortConfig,
    pub server: ServerConfig,
    pub clients: BTreeMap<ClientKind, CommandTemplate>,
    pub diff: CommandTemplate,
    /// Host name bound by the port probe; defaults to this machine's name.
    pub hostname: Option<String>,
    pub conditionals: BTreeMap<Conditional, bool>,
    /// Offending test names are listed only while the count stays below this.
    pub display_cap: usize,
    /// Launch children in their own process group.
    pub process_groups: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        let mut clients = BTreeMap::new();
        clients.insert(ClientKind::Sql, CommandTemplate::new(["mclient", "-lsql", "-ftest"]));
        clients.insert(ClientKind::Mal, CommandTemplate::new(["mclient", "-lmal", "-ftest"]));
        clients.insert(ClientKind::Python, CommandTemplate::new(["python3"]));
        RunConfig {
            timeout_secs: 60,
            accuracy: 1,
            diff_context: 1,
            diff_ignore: "^#".to_string(),
            ports: PortConfig::default(),
            server: ServerConfig::default(),
            clients,
            diff: CommandTemplate::new(["Mdiff"]),
            hostname: None,
            conditionals: BTreeMap::new(),
            display_cap: 30,
            process_groups: true,
        }
    }
}

impl RunConfig {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: RunConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ports.low >= self.ports.high {
            return Err(MtestError::InvalidConfig(format!(
                "empty port range [{}, {})",
                self.ports.low, self.ports.high
            )));
        }
        if self.server.command.is_empty() {
            return Err(MtestError::InvalidConfig("server command is empty".into()));
        }
        if self.diff.is_empty() {
            return Err(MtestError::InvalidConfig("diff command is empty".into()));
        }
        if self.server.sentinel.is_empty() {
            return Err(MtestError::InvalidConfig("readiness sentinel is empty".into()));
        }
        regex::Regex::new(&self.diff_ignore)?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Value of a conditional flag; unknown flags are false.
    pub fn conditional(&self, key: Conditional) -> bool {
        self.conditionals.get(&key).copied().unwrap_or(false)
    }

    pub fn client(&self, kind: ClientKind) -> Option<&CommandTemplate> {
        self.clients.get(&kind).filter(|c| !c.is_empty())
    }

    /// Rewrite `port=<old>` in the server and every client template.
    pub fn rewrite_port(&mut self, old: u16, new: u16) {
        self.server.command.rewrite_port(old, new);
        for template in self.clients.values_mut() {
            template.rewrite_port(old, new);
        }
        if self.ports.port == old {
            self.ports.port = new;
        }
    }
}

/// How the service port is chosen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PortDiscovery {
    /// Use `port`, reassigning once if it is busy.
    #[default]
    Fixed,
    /// Draw a random free port from the range at run start.
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PortConfig {
    pub low: u16,
    /// Exclusive upper bound.
    pub high: u16,
    pub attempts: u32,
    pub port: u16,
    pub discovery: PortDiscovery,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            low: 30000,
            high: 40000,
            attempts: 9,
            port: 50000,
            discovery: PortDiscovery::Fixed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Server executable and fixed leading arguments.
    pub command: CommandTemplate,
    /// Prefix of the stdout line announcing readiness.
    pub sentinel: String,
    /// Written to stdin right after launch; the server echoes the sentinel
    /// once it has processed it.
    pub ready_input: String,
    /// Graceful shutdown command written to stdin.
    pub quit_command: String,
    pub dbfarm: Option<PathBuf>,
    pub db_name: String,
    pub transient_storage: Option<PathBuf>,
    pub threads: Option<u32>,
    pub module_path: Option<PathBuf>,
    /// `--set key=value` overrides.
    pub settings: BTreeMap<String, String>,
    /// Pause before the single restart attempt.
    pub restart_cooldown_secs: u64,
    pub liveness_attempts: u32,
    pub liveness_interval_ms: u64,
    /// Fed to the server on stdin to make it list its modules during the
    /// platform probe.
    pub probe_input: String,
}

/// MAL program printing the server's loaded modules as
/// `Modules: 'a','b',...` and quitting.
const MODULE_LISTING: &str = r#"c := mdb.modules();
modsid := algebra.subunique(c);
mods := algebra.leftfetchjoin(modsid,c);
s := "\nModules: ";
sep := "";
barrier (h:oid,t:str) := iterator.new(mods);
    s := s + sep;
    s := s + "'";
    s := s + t;
    s := s + "'";
    sep := ",";
redo (h:oid,t:str) := iterator.next(mods);
exit h;
s := s + "\n";
io.printf(s);
clients.quit();
"#;

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            command: CommandTemplate::new(["mserver5"]),
            sentinel: "Ready.".to_string(),
            ready_input: "io.printf(\"\\nReady.\\n\");\n".to_string(),
            quit_command: "clients.quit();\n".to_string(),
            dbfarm: None,
            db_name: "mTests".to_string(),
            transient_storage: None,
            threads: None,
            module_path: None,
            settings: BTreeMap::new(),
            restart_cooldown_secs: 120,
            liveness_attempts: 3,
            liveness_interval_ms: 1000,
            probe_input: MODULE_LISTING.to_string(),
        }
    }
}

impl ServerConfig {
    /// Full server argv for one test.
    pub fn argv(&self, port: u16) -> Vec<String> {
        let mut argv = self.command.args.clone();
        if let Some(farm) = &self.dbfarm {
            argv.push(format!(
                "--dbpath={}",
                farm.join(&self.db_name).display()
            ));
        }
        if let Some(path) = &self.transient_storage {
            argv.push(format!("--dbextra={}", path.display()));
        }
        if let Some(threads) = self.threads {
            argv.push("--set".to_string());
            argv.push(format!("gdk_nr_threads={threads}"));
        }
        if let Some(path) = &self.module_path {
            argv.push("--set".to_string());
            argv.push(format!("monet_mod_path={}", path.display()));
        }
        for (k, v) in &self.settings {
            argv.push("--set".to_string());
            argv.push(format!("{k}={v}"));
        }
        argv.push("--set".to_string());
        argv.push(format!("port={port}"));
        argv
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_secs(self.restart_cooldown_secs)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }
}

/// An argv vector. The first element is the program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct CommandTemplate {
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandTemplate {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn program(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Template with `extra` appended.
    pub fn with_args<I, S>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = self.args.clone();
        args.extend(extra.into_iter().map(Into::into));
        CommandTemplate { args }
    }

    /// Replace every `port=<old>` with `port=<new>`. Returns the number of
    /// rewritten occurrences.
    pub fn rewrite_port(&mut self, old: u16, new: u16) -> usize {
        let from = format!("port={old}");
        let to = format!("port={new}");
        let mut count = 0;
        for arg in &mut self.args {
            let hits = arg.matches(&from).count();
            if hits > 0 {
                *arg = arg.replace(&from, &to);
                count += hits;
            }
        }
        count
    }

    /// Shell-ish rendering for logs and prompt lines.
    pub fn display(&self) -> String {
        self.args.join(" ")
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

/// Client programs a test can be driven by.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    Sql,
    Mal,
    Python,
}

/// Named conditional flags a test may require via its `.cond` file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Conditional {
    Debug,
    Assert,
    Optimize,
    Geom,
    Netcdf,
    Shp,
    Int128,
    Pcre,
    Rintegration,
    Pyintegration,
    Lidar,
    Fits,
    Odbc,
    Windows,
    NotWindows,
    Linux,
}

impl FromStr for Conditional {
    type Err = MtestError;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| MtestError::InvalidConfig(format!("unknown conditional {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_is_default() {
        let c: RunConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(c, RunConfig::default());
        assert_eq!(c.timeout_secs, 60);
        assert_eq!(c.ports.low, 30000);
        assert_eq!(c.ports.high, 40000);
        assert_eq!(c.ports.attempts, 9);
        assert_eq!(c.server.sentinel, "Ready.");
        assert_eq!(c.server.restart_cooldown_secs, 120);
        assert_eq!(c.display_cap, 30);
        c.validate().unwrap();
    }

    #[test]
    fn test_partial_override() {
        let c: RunConfig = serde_json::from_str(
            r#"{"timeout_secs": 5, "ports": {"discovery": "random", "attempts": 3},
                "conditionals": {"GEOM": true}}"#,
        )
        .unwrap();
        assert_eq!(c.timeout_secs, 5);
        assert_eq!(c.ports.discovery, PortDiscovery::Random);
        assert_eq!(c.ports.attempts, 3);
        assert_eq!(c.ports.low, 30000);
        assert!(c.conditional(Conditional::Geom));
        assert!(!c.conditional(Conditional::Netcdf));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut c = RunConfig::default();
        c.ports.low = 40000;
        assert!(matches!(c.validate(), Err(MtestError::InvalidConfig(_))));

        let mut c = RunConfig::default();
        c.diff_ignore = "(".into();
        assert!(matches!(c.validate(), Err(MtestError::Pattern(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mtest.json");
        std::fs::write(&path, r#"{"accuracy": 3}"#).unwrap();
        assert_eq!(RunConfig::load(&path).unwrap().accuracy, 3);
    }

    #[test]
    fn test_rewrite_port() {
        let mut t = CommandTemplate::new(["mclient", "--set", "port=50000", "-p", "50000"]);
        assert_eq!(t.rewrite_port(50000, 31234), 1);
        assert_eq!(t.args[2], "port=31234");
        assert_eq!(t.args[4], "50000");
        assert_eq!(t.rewrite_port(1, 2), 0);
    }

    #[test]
    fn test_config_rewrite_port_reaches_all_templates() {
        let mut c = RunConfig::default();
        c.server.command = CommandTemplate::new(["mserver5", "--set", "port=50000"]);
        c.clients.insert(
            ClientKind::Sql,
            CommandTemplate::new(["mclient", "port=50000"]),
        );
        c.rewrite_port(50000, 31000);
        assert_eq!(c.ports.port, 31000);
        assert_eq!(c.server.command.args[2], "port=31000");
        assert_eq!(c.clients[&ClientKind::Sql].args[1], "port=31000");
    }

    #[test]
    fn test_server_argv() {
        let mut s = ServerConfig::default();
        s.dbfarm = Some(PathBuf::from("/farm"));
        s.threads = Some(1);
        s.settings.insert("mapi_open".into(), "true".into());
        let argv = s.argv(31000);
        assert_eq!(argv[0], "mserver5");
        assert!(argv.contains(&"--dbpath=/farm/mTests".to_string()));
        assert!(argv.contains(&"gdk_nr_threads=1".to_string()));
        assert!(argv.contains(&"mapi_open=true".to_string()));
        assert_eq!(argv.last().unwrap(), "port=31000");
    }

    #[test]
    fn test_platform_query_asks_server_for_modules() {
        let input = ServerConfig::default().probe_input;
        assert!(input.contains("mdb.modules()"));
        assert!(input.contains("\\nModules: "));
        assert!(!input.contains("'sql','mal'"));
        assert!(input.trim_end().ends_with("clients.quit();"));
    }

    #[test]
    fn test_conditional_from_str() {
        assert_eq!("GEOM".parse::<Conditional>().unwrap(), Conditional::Geom);
        assert_eq!(
            "NOT_WINDOWS".parse::<Conditional>().unwrap(),
            Conditional::NotWindows
        );
        assert!("BOGUS".parse::<Conditional>().is_err());
    }

    #[test]
    fn test_client_lookup_skips_empty() {
        let mut c = RunConfig::default();
        c.clients.insert(ClientKind::Python, CommandTemplate::default());
        assert!(c.client(ClientKind::Python).is_none());
        assert_eq!(c.client(ClientKind::Sql).and_then(|t| t.program()), Some("mclient"));
    }
}
