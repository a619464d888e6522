//! # gotrace - Main Entry Point
//!
//! Two subcommands:
//! - **record** (`gotrace record <PROCESS>`): attach probes and capture until stopped
//! - **discover** (`gotrace discover --binary <PATH>`): print a target specification

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

use gotrace::cli::{Args, Command, DiscoverArgs, RecordArgs};
use gotrace::consumer::{CaptureOptions, StopReason};
use gotrace::domain::{CaptureError, Pid};
use gotrace::lifecycle::{install_signal_handlers, run_capture, Cancellation};
use gotrace::preflight::{check_process_exists, run_preflight_checks};
use gotrace::probes::{discover_targets, AyaBackend, TargetSpec};
use gotrace::process_lookup::{find_process_by_name, resolve_exe_path};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

/// Capture faults exit with their OS error magnitude, everything else by message
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(capture) = err.downcast_ref::<CaptureError>() {
        return capture.exit_code();
    }

    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else if msg.contains("missing required argument") || msg.contains("cannot use process") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    match Args::parse().command {
        Command::Record(args) => record(args).await,
        Command::Discover(args) => discover(&args),
    }
}

/// Resolve the traced binary and (optionally) PID from CLI arguments.
///
/// - `gotrace record my-server` - find process by name, binary from /proc
/// - `gotrace record --pid 1234` - explicit PID, binary from /proc
/// - `gotrace record --binary ./server` - every process running the binary
fn resolve_binary_and_pid(args: &RecordArgs) -> Result<(PathBuf, Option<Pid>)> {
    if let Some(ref name) = args.process {
        if args.pid.is_some() || args.binary.is_some() {
            anyhow::bail!(
                "Cannot use PROCESS argument with --pid or --binary.\n\n\
                 Use either:\n  \
                 gotrace record my-server       (auto-detect)\n  \
                 gotrace record --pid 1234      (explicit PID)"
            );
        }
        let info = find_process_by_name(name)?;
        return Ok((info.exe_path, Some(info.pid)));
    }

    let pid = args.pid.map(Pid);
    let binary = match (&args.binary, pid) {
        (Some(binary), _) => std::fs::canonicalize(binary)
            .with_context(|| format!("Failed to resolve path: {}", binary.display()))?,
        (None, Some(pid)) => resolve_exe_path(pid)?,
        (None, None) => anyhow::bail!(
            "Missing required argument: PROCESS, --pid, --binary or --spec\n\n\
             Usage:\n  \
             gotrace record my-server       Auto-detect PID and binary\n  \
             gotrace record --pid 1234      Explicit PID, auto-detect binary\n\n\
             Run 'gotrace record --help' for more options"
        ),
    };
    Ok((binary, pid))
}

fn resolve_targets(args: &RecordArgs) -> Result<TargetSpec> {
    if let Some(ref path) = args.spec {
        let mut targets = TargetSpec::from_file(path)?;
        if args.pid.is_some() {
            targets.pid = args.pid;
        }
        return Ok(targets);
    }

    let (binary, pid) = resolve_binary_and_pid(args)?;
    let mut targets = discover_targets(&binary, &args.prefix)?;
    targets.pid = pid.map(|pid| pid.0);
    Ok(targets)
}

async fn record(args: RecordArgs) -> Result<()> {
    let quiet = args.quiet;
    let targets = resolve_targets(&args)?;

    if let Some(pid) = targets.pid {
        check_process_exists(pid)?;
    }
    run_preflight_checks(&targets.binary, &args.bundle, quiet)?;

    if let Some(ref path) = args.save_spec {
        std::fs::write(path, targets.to_json()?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Saved target specification to {}", path.display());
    }

    if !quiet {
        println!("gotrace v{}", env!("CARGO_PKG_VERSION"));
        println!("binary: {}", targets.binary.display());
        match targets.pid {
            Some(pid) => println!("pid: {pid}"),
            None => println!("pid: any"),
        }
        println!("functions: {} ({} probes)", targets.functions.len(), targets.site_count());
        println!("schema: {}", args.schema);
        println!("output: {}", args.output.display());
    }

    let cancel = Cancellation::new();
    let listener = install_signal_handlers(cancel.clone()).context("Failed to install signal handlers")?;

    let options = CaptureOptions {
        revision: args.schema,
        poll_timeout: args.poll_timeout(),
        duration: args.duration_limit(),
        watch_pid: targets.pid.map(Pid),
    };

    let result = run_capture(AyaBackend::new(&args.bundle), &targets, &args.output, &options, &cancel).await;
    listener.abort();
    let summary = result?;

    if !quiet {
        let reason = match summary.stop {
            StopReason::Cancelled | StopReason::Interrupted => "interrupted",
            StopReason::DurationElapsed => "duration reached",
            StopReason::TargetExited => "target exited",
        };
        eprintln!(
            "\n{reason}: {:.1}s, {} records in {} polls → {}",
            summary.elapsed.as_secs_f64(),
            summary.records,
            summary.polls,
            args.output.display()
        );
    }

    Ok(())
}

fn discover(args: &DiscoverArgs) -> Result<()> {
    let targets = discover_targets(&args.binary, &args.prefix)?;
    let json = targets.to_json()?;

    match args.out {
        Some(ref path) => {
            std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!(
                "saved: {} ({} functions, {} probes)",
                path.display(),
                targets.functions.len(),
                targets.site_count()
            );
        }
        None => println!("{json}"),
    }
    Ok(())
}
