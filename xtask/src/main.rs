use anyhow::{Context, Result};
use clap::Parser;
use std::process::Command;

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Build the probe bundle loaded by `gotrace record`
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::BuildEbpf { target } => build_ebpf(&target)?,
    }

    Ok(())
}

fn build_ebpf(target: &str) -> Result<()> {
    // gotrace-ebpf is excluded from the workspace; build it through its own manifest
    // but share the workspace target directory so the default bundle path resolves.
    let mut cmd = Command::new("cargo");
    cmd.arg("+nightly")
        .arg("build")
        .arg("--manifest-path")
        .arg("gotrace-ebpf/Cargo.toml")
        .arg("--target-dir")
        .arg("target")
        .arg("--target")
        .arg(target)
        .arg("-Z")
        .arg("build-std=core")
        .arg("--release");

    let status = cmd.status().context("Failed to build eBPF program")?;

    if !status.success() {
        anyhow::bail!("Failed to build eBPF program");
    }

    println!("✓ probe bundle built: target/{target}/release/gotrace");

    Ok(())
}
