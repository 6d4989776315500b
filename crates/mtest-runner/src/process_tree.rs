//! Forceful termination of a process together with its descendants.
//!
//! POSIX children are normally started as process-group leaders, so
//! signalling the negated pid reaches the whole tree. Descendants that left
//! the group, or a child launched without its own group, are found through
//! `/proc` and killed one by one. Windows has no process groups of that
//! kind; `taskkill /T` walks the tree instead.

use std::io;
use std::time::Duration;

/// Send SIGKILL to the tree rooted at `pid`.
///
/// `group` says whether the child was made a process-group leader at spawn
/// time. The tree is frozen with SIGSTOP before the kill so that no member
/// can fork or be reparented in between. A tree that already exited is not
/// an error.
#[cfg(unix)]
pub fn kill_tree(pid: u32, group: bool) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let root = Pid::from_raw(pid as i32);
    let mut tree = vec![pid];
    // Two passes catch children forked while the first pass was stopping.
    for _ in 0..2 {
        for p in descendants(pid) {
            if !tree.contains(&p) {
                tree.push(p);
            }
        }
        for &p in &tree {
            let _ = kill(Pid::from_raw(p as i32), Signal::SIGSTOP);
        }
    }

    let res = if group {
        killpg(root, Signal::SIGKILL)
    } else {
        kill(root, Signal::SIGKILL)
    };
    for &p in &tree[1..] {
        let _ = kill(Pid::from_raw(p as i32), Signal::SIGKILL);
    }
    if tree.len() > 1 {
        tracing::debug!(pid, descendants = tree.len() - 1, "killed process tree");
    }
    match res {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
    }
}

/// All live descendants of `pid`, parents before children. Empty where
/// `/proc` is unavailable.
#[cfg(unix)]
fn descendants(pid: u32) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut parents = Vec::new();
    for entry in entries.flatten() {
        let Some(child) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        if let Some(ppid) = parent_of(child) {
            parents.push((child, ppid));
        }
    }

    let mut found = Vec::new();
    let mut frontier = vec![pid];
    while let Some(parent) = frontier.pop() {
        for &(child, ppid) in &parents {
            if ppid == parent && child != pid && !found.contains(&child) {
                found.push(child);
                frontier.push(child);
            }
        }
    }
    found
}

/// Parent pid from `/proc/<pid>/stat`. The command name may hold spaces
/// and parentheses, so fields are counted after the last `)`.
#[cfg(unix)]
fn parent_of(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(windows)]
pub fn kill_tree(pid: u32, _group: bool) -> io::Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()?;
    if !status.success() {
        tracing::debug!(pid, code = ?status.code(), "taskkill reported failure");
    }
    Ok(())
}

/// Whether `pid` still names a live (non-zombie) process.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    // A zombie still accepts signal 0; on Linux its state is 'Z'.
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .map_or(true, |state| state != "Z"),
        Err(_) => true,
    }
}

const STACK_TRACE_TIMEOUT: Duration = Duration::from_secs(10);

/// Best-effort stack dump of a running process for timeout diagnostics.
///
/// Returns `None` when no tracer is installed or it produced nothing.
pub async fn capture_stack(pid: u32) -> Option<String> {
    let argv = stack_tracer(pid)?;
    let mut cmd = tokio::process::Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true);
    let output = tokio::time::timeout(STACK_TRACE_TIMEOUT, cmd.output())
        .await
        .ok()?
        .ok()?;
    let text = String::from_utf8_lossy(&output.stdout).into_owned();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(unix)]
fn stack_tracer(pid: u32) -> Option<Vec<String>> {
    Some(vec!["pstack".to_string(), pid.to_string()])
}

#[cfg(windows)]
fn stack_tracer(pid: u32) -> Option<Vec<String>> {
    let cdb = [
        r"c:\Program Files\Debugging Tools for Windows (x64)\cdb.exe",
        r"c:\Program Files\Debugging Tools for Windows (x86)\cdb.exe",
    ]
    .into_iter()
    .find(|p| std::path::Path::new(p).exists())?;
    Some(vec![
        cdb.to_string(),
        "-pv".to_string(),
        "-p".to_string(),
        pid.to_string(),
        "-lines".to_string(),
        "-c".to_string(),
        "~*kP;!locks;q".to_string(),
    ])
}
