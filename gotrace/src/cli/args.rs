//! CLI argument definitions

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::probes::{DEFAULT_BUNDLE_PATH, DEFAULT_PREFIX};
use crate::record::SchemaRevision;

#[derive(Parser, Debug)]
#[command(
    name = "gotrace",
    version,
    about = "Capture entry/exit events of Go functions through eBPF uprobes",
    after_help = "\
EXAMPLES:
    sudo gotrace record my-server                    Trace main.* of a running process
    sudo gotrace record --pid 1234 --duration 30     Stop after 30 seconds
    sudo gotrace record --spec targets.json          Trace exactly what a spec lists
    gotrace discover --binary ./server --out t.json  Write a spec to edit by hand"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Attach probes and write every event to the output file until stopped
    Record(RecordArgs),
    /// List traceable functions of a binary as a target specification
    Discover(DiscoverArgs),
}

#[derive(ClapArgs, Debug)]
pub struct RecordArgs {
    /// Process name to trace (auto-detects PID and binary)
    #[arg(value_name = "PROCESS")]
    pub process: Option<String>,

    /// Process ID to trace (binary path auto-detected from /proc)
    #[arg(short, long)]
    pub pid: Option<i32>,

    /// Binary to trace; without a PID every process running it is traced
    #[arg(short, long)]
    pub binary: Option<PathBuf>,

    /// Target specification (JSON) instead of discovering `--prefix` functions
    #[arg(short, long, value_name = "FILE")]
    pub spec: Option<PathBuf>,

    /// Compiled probe bundle
    #[arg(long, value_name = "FILE", default_value = DEFAULT_BUNDLE_PATH)]
    pub bundle: PathBuf,

    /// Output file, truncated at startup
    #[arg(short, long, value_name = "FILE", default_value = "output.txt")]
    pub output: PathBuf,

    /// Record layout the probe bundle was built with
    #[arg(long, value_enum, default_value_t = SchemaRevision::default())]
    pub schema: SchemaRevision,

    /// Symbol prefix of the functions to trace
    #[arg(long, default_value = DEFAULT_PREFIX)]
    pub prefix: String,

    /// Ring buffer poll timeout in milliseconds
    #[arg(long, default_value = "10", value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout_ms: u64,

    /// Stop after N seconds (0 = until interrupted)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Also write the discovered target specification to FILE
    #[arg(long, value_name = "FILE", conflicts_with = "spec")]
    pub save_spec: Option<PathBuf>,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl RecordArgs {
    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn duration_limit(&self) -> Option<Duration> {
        (self.duration > 0).then(|| Duration::from_secs(self.duration))
    }
}

#[derive(ClapArgs, Debug)]
pub struct DiscoverArgs {
    /// Binary to inspect
    #[arg(short, long)]
    pub binary: PathBuf,

    /// Symbol prefix of the functions to list
    #[arg(long, default_value = DEFAULT_PREFIX)]
    pub prefix: String,

    /// Write the specification here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub out: Option<PathBuf>,
}
