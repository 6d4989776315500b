//! Platform descriptor used to pick platform-specific reference output.
//!
//! The operating-system half comes from the host (`uname`, `/etc/os-release`);
//! the build half (word size, OID width, 128-bit integers, static linking,
//! thread count) is read from the banner the server prints at startup.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;

use crate::error::{BannerError, Result};

/// Immutable description of the platform under test.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlatformDescriptor {
    /// Kernel name, e.g. `Linux`.
    pub system: String,
    /// Kernel release, e.g. `4.18`.
    pub system_release: String,
    /// Distribution id, e.g. `Fedora`; empty when unknown.
    pub distro: String,
    /// Distribution version, e.g. `39`; empty when unknown.
    pub distro_version: String,
    /// Word size of the server build: 32 or 64.
    pub bits: u8,
    /// OID width of the server build: 32 or 64.
    pub oid_width: u8,
    pub has_int128: bool,
    pub is_single_threaded: bool,
    pub is_static: bool,
}

/// What the server reported about itself at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerBanner {
    pub bits: u8,
    pub oid_width: u8,
    pub has_int128: bool,
    pub is_static: bool,
    pub threads: Option<u32>,
    pub modules: Vec<String>,
}

impl ServerBanner {
    /// Parse the server's startup output.
    ///
    /// Recognized lines:
    /// - `# Compiled for <triple>/64bit with 64bit OIDs and 128bit integers dynamically linked`
    /// - `# Serving database <name>, using 8 threads`
    /// - `Modules: 'sql','mal'`
    pub fn parse(output: &str) -> std::result::Result<Self, BannerError> {
        if output.trim().is_empty() {
            return Err(BannerError::Empty);
        }

        let (compiled, serving) = banner_patterns();

        let mut banner = ServerBanner::default();
        let mut saw_modules = false;
        for line in output.lines() {
            if let Some(c) = compiled.and_then(|re| re.captures(line)) {
                banner.bits = c[1].parse().unwrap_or_default();
                banner.oid_width = c[2].parse().unwrap_or_default();
                banner.has_int128 = &c[3] == " and 128bit integers";
                banner.is_static = &c[4] == "statically";
            }
            if let Some(c) = serving.and_then(|re| re.captures(line)) {
                banner.threads = c[1].parse().ok();
            }
            if let Some(list) = line.strip_prefix("Modules: ") {
                saw_modules = true;
                banner.modules = parse_module_list(list);
            }
        }

        if banner.bits == 0 {
            return Err(BannerError::MissingBits);
        }
        if banner.oid_width == 0 {
            return Err(BannerError::MissingOids);
        }
        if !saw_modules || banner.modules.is_empty() {
            return Err(BannerError::MissingModules);
        }
        Ok(banner)
    }
}

fn banner_patterns() -> (Option<&'static Regex>, Option<&'static Regex>) {
    static COMPILED: OnceLock<Option<Regex>> = OnceLock::new();
    static SERVING: OnceLock<Option<Regex>> = OnceLock::new();
    let compiled = COMPILED.get_or_init(|| {
        Regex::new(
            r"^# Compiled for .*/([63][42])bit with ([63][42])bit OIDs;?(| and 128bit integers) ([^ ]*) linked",
        )
        .ok()
    });
    let serving = SERVING.get_or_init(|| {
        Regex::new(r"^# Serving database .*, using ([0-9]+) threads?").ok()
    });
    (compiled.as_ref(), serving.as_ref())
}

/// `'sql','mal'` -> `["sql", "mal"]`
fn parse_module_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|m| m.trim().trim_matches(|c| c == '\'' || c == '"').to_string())
        .filter(|m| !m.is_empty())
        .collect()
}

/// Operating-system identity of the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostIdentity {
    pub system: String,
    pub system_release: String,
    pub distro: String,
    pub distro_version: String,
}

impl HostIdentity {
    /// Detect the running host.
    pub fn detect() -> Self {
        let (system, system_release) = kernel_identity();
        let (distro, distro_version) = std::fs::read_to_string("/etc/os-release")
            .map(|s| parse_os_release(&s))
            .unwrap_or_default();
        HostIdentity {
            system,
            system_release,
            distro,
            distro_version,
        }
    }
}

#[cfg(unix)]
fn kernel_identity() -> (String, String) {
    match nix::sys::utsname::uname() {
        Ok(uts) => (
            uts.sysname().to_string_lossy().into_owned(),
            short_release(&uts.release().to_string_lossy()),
        ),
        Err(_) => (std::env::consts::OS.to_string(), String::new()),
    }
}

#[cfg(not(unix))]
fn kernel_identity() -> (String, String) {
    ("Windows".to_string(), String::new())
}

/// `4.18.0-513.el8.x86_64` -> `4.18`
fn short_release(release: &str) -> String {
    release
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .next()
        .unwrap_or_default()
        .split('.')
        .take(2)
        .collect::<Vec<_>>()
        .join(".")
}

/// Distribution name and version from an os-release file.
fn parse_os_release(contents: &str) -> (String, String) {
    let mut name = String::new();
    let mut version = String::new();
    for line in contents.lines() {
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "NAME" if name.is_empty() => {
                    name = value.split_whitespace().next().unwrap_or_default().to_string()
                }
                "VERSION_ID" => version = value,
                _ => {}
            }
        }
    }
    (name, version)
}

impl PlatformDescriptor {
    /// Combine host identity with what the server reported.
    pub fn new(host: HostIdentity, banner: &ServerBanner) -> Self {
        PlatformDescriptor {
            system: host.system,
            system_release: host.system_release,
            distro: host.distro,
            distro_version: host.distro_version,
            bits: banner.bits,
            oid_width: banner.oid_width,
            has_int128: banner.has_int128,
            is_single_threaded: banner.threads == Some(1),
            is_static: banner.is_static,
        }
    }

    /// Load a descriptor saved by a previous run (used when approving output
    /// without a server at hand).
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Fully qualified name of this machine, falling back to `localhost`.
pub fn local_hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            let name = name.to_string_lossy().into_owned();
            if !name.is_empty() {
                return name;
            }
        }
    }
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}
