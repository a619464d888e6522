//! Pre-flight checks for gotrace
//!
//! Validates system requirements before loading the probe bundle, so that the
//! common setup mistakes fail with an actionable message instead of a
//! verifier or attach error.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use object::{Object, ObjectSection};
use std::path::Path;

/// BPF ring buffers arrived in Linux 5.8
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Run all pre-flight checks before loading the probe bundle
///
/// # Errors
/// Returns the first failed check
pub fn run_preflight_checks(binary: &Path, bundle: &Path, quiet: bool) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    check_file_exists(binary, "Binary")?;
    check_bundle_exists(bundle)?;
    check_symbol_table(binary, quiet)?;
    Ok(())
}

/// Check if running with sufficient privileges for eBPF
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    // CAP_BPF + CAP_PERFMON would do, but checking capabilities needs more than libc
    bail!(
        "Permission denied: gotrace requires root privileges to load eBPF programs.\n\n\
         Run with: sudo gotrace ..."
    );
}

/// Parse "major.minor" from a release string like `6.1.0-arch1-1`
fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;

    // "Linux version 5.15.0-generic ..."
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");

    let Some((major, minor)) = parse_kernel_release(release) else {
        // Can't parse, let the loader decide
        return Ok(());
    };

    if (major, minor) < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {major}.{minor} is too old.\n\n\
             gotrace requires Linux {}.{} or newer for BPF ring buffer support.\n\
             Current kernel: {release}",
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
        );
    }

    Ok(())
}

fn check_file_exists(path: &Path, what: &str) -> Result<()> {
    if !path.exists() {
        bail!("{what} not found: {}", path.display());
    }
    if !path.is_file() {
        bail!("{what} is not a file: {}", path.display());
    }
    Ok(())
}

fn check_bundle_exists(bundle: &Path) -> Result<()> {
    if !bundle.is_file() {
        bail!(
            "Probe bundle not found: {}\n\n\
             Build it with: cargo xtask build-ebpf\n\
             or point --bundle at a compiled probe object.",
            bundle.display()
        );
    }
    Ok(())
}

/// Probes are attached by symbol name, so a stripped binary cannot be traced
fn check_symbol_table(binary: &Path, quiet: bool) -> Result<()> {
    let file_data = std::fs::read(binary)
        .with_context(|| format!("Failed to read binary: {}", binary.display()))?;

    let Ok(obj) = object::File::parse(&*file_data) else {
        // Not an object file, let discovery report it
        return Ok(());
    };

    let has_symtab = obj.section_by_name(".symtab").is_some_and(|s| s.size() > 0);
    if !has_symtab {
        bail!(
            "{} has no symbol table.\n\n\
             Rebuild without -ldflags=\"-s\" so functions can be located.",
            binary.display()
        );
    }

    let has_gopclntab = obj.section_by_name(".gopclntab").is_some();
    if !has_gopclntab && !quiet {
        eprintln!("warning: {} does not look like a Go binary", binary.display());
    }

    Ok(())
}

/// Check if the target process exists
///
/// # Errors
/// Returns an error if `/proc/<pid>` is missing
pub fn check_process_exists(pid: i32) -> Result<()> {
    let proc_path = format!("/proc/{pid}");
    if !Path::new(&proc_path).exists() {
        bail!(
            "Process {pid} not found.\n\n\
             Is the process still running? Check with: ps -p {pid}"
        );
    }
    Ok(())
}
