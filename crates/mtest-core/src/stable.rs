//! Selection of the platform-specific reference ("stable") output of a test.
//!
//! Reference files are named
//! `<test>.stable.<stream>[.(<system>[<release>]|<distro>[<version>])][.<bits>bit][.oid<width>][.int128][.single][.STATIC]`
//! with every bracketed segment optional and the segments in that order.
//! Among the files present, the longest name matching the current platform
//! is the most specific and wins.

use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

use crate::classify::Stream;
use crate::error::Result;
use crate::platform::PlatformDescriptor;

/// Result of resolving one stream's reference file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub path: PathBuf,
    /// The reference did not exist and an empty file was created; the diff
    /// must run at exact accuracy.
    pub synthesized: bool,
}

impl Resolution {
    pub fn force_exact(&self) -> bool {
        self.synthesized
    }
}

/// Resolves reference outputs for one platform.
#[derive(Debug, Clone)]
pub struct StableOutputResolver {
    platform: PlatformDescriptor,
}

impl StableOutputResolver {
    pub fn new(platform: PlatformDescriptor) -> Self {
        Self { platform }
    }

    pub fn platform(&self) -> &PlatformDescriptor {
        &self.platform
    }

    /// Regex matching every reference name acceptable on this platform for
    /// `test`. The `tp` group captures the stream.
    pub fn pattern(&self, test: &str) -> Result<Regex> {
        let p = &self.platform;
        let optional = |on: bool, seg: &str| {
            if on {
                format!(r"(\.{seg})?")
            } else {
                String::new()
            }
        };
        let re = format!(
            r"^{test}\.stable\.(?P<tp>out|err)(\.({sys}({rel})?|{dist}({ver})?))?(\.{bits}bit)?(\.oid{oids})?{int128}{single}{stat}$",
            test = regex::escape(test),
            sys = non_empty(&p.system),
            rel = non_empty(&p.system_release),
            dist = non_empty(&p.distro),
            ver = non_empty(&p.distro_version),
            bits = p.bits,
            oids = p.oid_width,
            int128 = optional(p.has_int128, "int128"),
            single = optional(p.is_single_threaded, "single"),
            stat = optional(p.is_static, "STATIC"),
        );
        Ok(Regex::new(&re)?)
    }

    /// Pick the most specific existing reference for `stream` without
    /// touching the filesystem beyond listing `dir`.
    ///
    /// Returns `None` when no file matches.
    pub fn best_match(&self, dir: &Path, test: &str, stream: Stream) -> Result<Option<PathBuf>> {
        let re = self.pattern(test)?;
        let mut best: Option<String> = None;
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            let Some(caps) = re.captures(&name) else {
                continue;
            };
            if &caps["tp"] != stream.as_str() {
                continue;
            }
            if best.as_ref().map_or(true, |b| b.len() < name.len()) {
                best = Some(name);
            }
        }
        Ok(best.map(|name| dir.join(name)))
    }

    /// Resolve the reference for `stream`.
    ///
    /// Falls back to the bare `<test>.stable.<stream>` name; when that does
    /// not exist either, an empty file is created there and the resolution
    /// is flagged as synthesized.
    pub fn resolve(&self, dir: &Path, test: &str, stream: Stream) -> Result<Resolution> {
        if let Some(path) = self.best_match(dir, test, stream)? {
            return Ok(Resolution {
                path,
                synthesized: false,
            });
        }
        let path = dir.join(format!("{test}.stable.{stream}"));
        let synthesized = !path.is_file();
        if synthesized {
            tracing::debug!(path = %path.display(), "creating empty reference output");
            fs::File::create(&path)?;
        }
        Ok(Resolution { path, synthesized })
    }
}

/// Escaped segment that can never match when the value is unknown.
fn non_empty(value: &str) -> String {
    if value.is_empty() {
        // file names never contain NUL
        r"\x00".to_string()
    } else {
        regex::escape(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux_418() -> PlatformDescriptor {
        PlatformDescriptor {
            system: "Linux".into(),
            system_release: "4.18".into(),
            distro: "Fedora".into(),
            distro_version: "39".into(),
            bits: 64,
            oid_width: 64,
            ..Default::default()
        }
    }

    fn touch(dir: &Path, names: &[&str]) {
        for n in names {
            fs::write(dir.join(n), "").unwrap();
        }
    }

    #[test]
    fn test_longest_match_wins() {
        let dir = tempfile::tempdir().unwrap();
        touch(
            dir.path(),
            &["t.stable.out", "t.stable.out.Linux", "t.stable.out.Linux4.18"],
        );
        let r = StableOutputResolver::new(linux_418())
            .resolve(dir.path(), "t", Stream::Out)
            .unwrap();
        assert_eq!(r.path, dir.path().join("t.stable.out.Linux4.18"));
        assert!(!r.force_exact());
    }

    #[test]
    fn test_missing_reference_is_synthesized() {
        let dir = tempfile::tempdir().unwrap();
        let r = StableOutputResolver::new(linux_418())
            .resolve(dir.path(), "t", Stream::Out)
            .unwrap();
        assert_eq!(r.path, dir.path().join("t.stable.out"));
        assert!(r.force_exact());
        assert_eq!(fs::read_to_string(&r.path).unwrap(), "");
    }

    #[test]
    fn test_bare_reference_not_forced() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["t.stable.err"]);
        let r = StableOutputResolver::new(linux_418())
            .resolve(dir.path(), "t", Stream::Err)
            .unwrap();
        assert_eq!(r.path, dir.path().join("t.stable.err"));
        assert!(!r.force_exact());
    }

    #[test]
    fn test_other_platforms_ignored() {
        let dir = tempfile::tempdir().unwrap();
        touch(
            dir.path(),
            &[
                "t.stable.out",
                "t.stable.out.Windows",
                "t.stable.out.Linux4.18.32bit",
                "t.stable.out.int128",
                "t.stable.err.Linux4.18.64bit.oid64",
            ],
        );
        let resolver = StableOutputResolver::new(linux_418());
        let out = resolver.resolve(dir.path(), "t", Stream::Out).unwrap();
        assert_eq!(out.path, dir.path().join("t.stable.out"));
        let err = resolver.resolve(dir.path(), "t", Stream::Err).unwrap();
        assert_eq!(err.path, dir.path().join("t.stable.err.Linux4.18.64bit.oid64"));
    }

    #[test]
    fn test_distro_and_build_flags() {
        let dir = tempfile::tempdir().unwrap();
        touch(
            dir.path(),
            &[
                "t.stable.out.Fedora",
                "t.stable.out.Fedora39.64bit.oid64.int128.single",
            ],
        );
        let mut p = linux_418();
        p.has_int128 = true;
        p.is_single_threaded = true;
        let r = StableOutputResolver::new(p)
            .resolve(dir.path(), "t", Stream::Out)
            .unwrap();
        assert_eq!(
            r.path,
            dir.path().join("t.stable.out.Fedora39.64bit.oid64.int128.single")
        );
    }

    #[test]
    fn test_segments_out_of_order_rejected() {
        let re = StableOutputResolver::new(linux_418()).pattern("t").unwrap();
        assert!(re.is_match("t.stable.out.Linux.64bit.oid64"));
        assert!(!re.is_match("t.stable.out.64bit.Linux"));
        assert!(!re.is_match("t.stable.out.oid64.64bit"));
    }

    #[test]
    fn test_unknown_distro_never_matches() {
        let mut p = linux_418();
        p.distro.clear();
        p.distro_version.clear();
        let re = StableOutputResolver::new(p).pattern("t").unwrap();
        assert!(!re.is_match("t.stable.out.39"));
        assert!(re.is_match("t.stable.out.Linux4.18"));
    }

    #[test]
    fn test_test_name_is_escaped() {
        let re = StableOutputResolver::new(linux_418()).pattern("a.b").unwrap();
        assert!(re.is_match("a.b.stable.out"));
        assert!(!re.is_match("aXb.stable.out"));
    }
}
