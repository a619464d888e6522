//! Structured error types for gotrace
//!
//! Using thiserror for automatic Display implementation and error chaining.
//!
//! Every variant is fatal to the capture: there are no retries. What differs is
//! *when* it can happen (before polling starts, or while polling) and the exit
//! status it maps to (see [`CaptureError::exit_code`]).

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::record::SchemaRevision;

/// A record span did not match the layout of the active schema revision
///
/// There is no version tag on the wire, so this is the only way a
/// producer/consumer schema disagreement shows up.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{revision} record must be {expected} bytes, got {actual}")]
    LengthMismatch { revision: SchemaRevision, expected: usize, actual: usize },
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to raise RLIMIT_MEMLOCK: {0}")]
    LimitRaise(#[source] io::Error),

    #[error("Failed to load probe bundle: {0}")]
    BundleLoad(String),

    #[error("Failed to attach {probe} to {binary}: {error}")]
    ProbeAttach { probe: String, binary: String, error: String },

    #[error("No functions to trace in {0}")]
    NoTargets(String),

    #[error("Failed to open output {}: {source}", path.display())]
    OutputOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write output: {0}")]
    OutputWrite(#[source] io::Error),

    #[error("Error polling ring buffer: {0}")]
    Poll(#[source] io::Error),

    #[error("Protocol violation: {0}")]
    Decode(#[from] DecodeError),

    #[error("Invalid target specification: {0}")]
    TargetSpec(String),

    #[error("Symbol discovery failed: {0}")]
    Symbols(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CaptureError {
    /// Process exit status for this fault
    ///
    /// The magnitude of the underlying OS error when there is one, `EPROTO` for
    /// schema mismatches, `1` otherwise. Always in `1..=255`.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn exit_code(&self) -> i32 {
        let code = match self {
            Self::LimitRaise(e) | Self::OutputWrite(e) | Self::Poll(e) | Self::Io(e) => {
                e.raw_os_error().unwrap_or(1)
            }
            Self::OutputOpen { source, .. } => source.raw_os_error().unwrap_or(1),
            Self::Decode(_) => libc::EPROTO,
            Self::BundleLoad(_)
            | Self::ProbeAttach { .. }
            | Self::NoTargets(_)
            | Self::TargetSpec(_)
            | Self::Symbols(_) => 1,
        };
        code.unsigned_abs().clamp(1, 255) as i32
    }
}
