//! # gotrace - Go Function Event Capture
//!
//! Attaches uprobes at the entry and at every return instruction of selected
//! Go functions, then drains the records the probes push into a BPF ring
//! buffer and writes one line per record to an output file.
//!
//! ## Pipeline
//!
//! ```text
//! target spec ──▶ probes (load, attach) ──▶ ring buffer
//!                                              │ poll every 10 ms
//!                                              ▼
//!                        output.txt ◀── sink ◀── record decode
//! ```
//!
//! ## Module Structure
//!
//! - [`record`]: fixed-size record layouts per schema revision → [`record::Record`]
//! - [`probes`]: target specification, symbol discovery, aya attachment
//! - [`consumer`]: the timeout-bounded poll/drain loop
//! - [`sink`]: semicolon-delimited output lines
//! - [`lifecycle`]: cancellation, signal handling, ordered teardown
//! - [`preflight`] / [`process_lookup`]: startup checks and target resolution
//! - [`cli`]: command-line arguments
//! - [`domain`]: `Pid` and the error taxonomy
//!
//! ## Typical Usage
//!
//! ```bash
//! cargo xtask build-ebpf
//! sudo ./target/release/gotrace record my-server
//! ```

pub mod cli;
pub mod consumer;
pub mod domain;
pub mod lifecycle;
pub mod preflight;
pub mod probes;
pub mod process_lookup;
pub mod record;
pub mod sink;
