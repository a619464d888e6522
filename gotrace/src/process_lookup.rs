//! Resolve the traced process and its executable from a name or PID.
//!
//! A name is compared with the kernel task name (`/proc/<pid>/comm`) and the
//! basename of the executable. Exact hits win over substring hits, so
//! `gotrace record api` picks `api` even while `api-gateway` is running.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::Pid;

/// `comm` holds at most 15 bytes, longer names are cut
const TASK_COMM_LEN: usize = 15;

/// A running process that can be traced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub exe_path: PathBuf,
    pub command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Closeness {
    Partial,
    Exact,
}

impl ProcessInfo {
    /// Snapshot of `pid`, `None` for kernel threads and processes we may not inspect
    fn read(pid: Pid) -> Option<Self> {
        let exe_path = fs::read_link(format!("/proc/{}/exe", pid.0)).ok()?;
        let comm = fs::read_to_string(format!("/proc/{}/comm", pid.0)).ok()?;
        Some(Self { pid, exe_path, command: comm.trim_end_matches('\n').to_string() })
    }

    fn exe_name(&self) -> &str {
        self.exe_path.file_name().and_then(|n| n.to_str()).unwrap_or("")
    }

    fn closeness(&self, pattern: &str) -> Option<Closeness> {
        let wanted = Path::new(pattern).file_name().and_then(|n| n.to_str()).unwrap_or(pattern);
        let wanted_comm = truncate_comm(wanted);

        if self.exe_name() == wanted || self.command == wanted_comm {
            Some(Closeness::Exact)
        } else if self.exe_name().contains(pattern) || self.command.contains(pattern) {
            Some(Closeness::Partial)
        } else {
            None
        }
    }
}

fn truncate_comm(name: &str) -> &str {
    if name.len() <= TASK_COMM_LEN {
        return name;
    }
    let mut end = TASK_COMM_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Pick the one process `pattern` names, preferring exact hits
fn select(pattern: &str, candidates: impl IntoIterator<Item = ProcessInfo>) -> Result<ProcessInfo> {
    let mut ranked: Vec<(Closeness, ProcessInfo)> =
        candidates.into_iter().filter_map(|p| Some((p.closeness(pattern)?, p))).collect();

    let Some(best) = ranked.iter().map(|(c, _)| *c).max() else {
        bail!(
            "No process matching '{pattern}' found.\n\
             Check running processes with: ps aux | grep {pattern}"
        );
    };
    ranked.retain(|(c, _)| *c == best);

    if ranked.len() > 1 {
        let list: Vec<String> = ranked
            .iter()
            .map(|(_, p)| format!("  {} ({}, {})", p.pid.0, p.command, p.exe_path.display()))
            .collect();
        bail!(
            "Multiple processes match '{pattern}':\n{}\n\n\
             Specify PID explicitly: gotrace record --pid <PID>",
            list.join("\n")
        );
    }
    Ok(ranked.remove(0).1)
}

/// Find exactly one process by name.
///
/// # Errors
/// Fails when `/proc` is unreadable, nothing matches, or the best matches are
/// ambiguous.
pub fn find_process_by_name(name: &str) -> Result<ProcessInfo> {
    let own_pid = std::process::id();
    let candidates = fs::read_dir("/proc")
        .context("Failed to read /proc")?
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|&pid| pid != own_pid)
        .filter_map(|pid| ProcessInfo::read(Pid(i32::try_from(pid).ok()?)));

    select(name, candidates)
}

/// Resolve the executable of `pid` via `/proc/<pid>/exe`.
///
/// # Errors
/// Returns error if the process doesn't exist or the link is not readable.
pub fn resolve_exe_path(pid: Pid) -> Result<PathBuf> {
    let exe_link = format!("/proc/{}/exe", pid.0);
    fs::read_link(&exe_link).with_context(|| format!("Cannot read {exe_link}"))
}
