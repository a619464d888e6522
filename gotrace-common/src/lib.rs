//! # Shared Data Structures (eBPF ↔ Userspace)
//!
//! Wire layouts of the capture records written by the probe program into the
//! `EVENTS` ring buffer, plus the probe-site table the probe consults. All
//! types use `#[repr(C)]` with explicit padding so the kernel side and the
//! userspace decoder agree byte for byte.
//!
//! ## Schema Revisions
//!
//! There is no version tag on the wire. Producer and consumer must agree on
//! the revision out of band:
//!
//! - [`EventRecordV1`] - numeric function id, no goroutine id (24 bytes)
//! - [`EventRecordV2`] - function name, goroutine id (64 bytes)
//! - [`EventRecordV3`] - numeric function id, goroutine id, continuation flag (32 bytes)
//!
//! The shipped probe bundle emits [`EventRecordV3`].

#![cfg_attr(not(test), no_std)]

// ============================================================================
// Constants
// ============================================================================

/// Wire value of `kind` for a function entry
pub const KIND_ENTRY: u8 = 0;

/// Wire value of `kind` for a function exit (any non-zero value decodes as exit)
pub const KIND_EXIT: u8 = 1;

/// Length of the NUL-padded function name carried by [`EventRecordV2`]
pub const FUNC_NAME_LEN: usize = 32;

/// Maximum number of probe sites (entry + every exit) in `PROBE_SITES`
pub const MAX_PROBE_SITES: u32 = 8192;

/// Size of the `EVENTS` ring buffer in bytes (must be a power of two multiple of the page size)
pub const EVENTS_RING_SIZE: u32 = 256 * 1024;

// ============================================================================
// Event Records
// ============================================================================

/// Revision 1: function code, kind, pid, tgid, timestamp
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventRecordV1 {
    /// Function code assigned by the target specification
    pub func_id: u32,

    /// [`KIND_ENTRY`] or [`KIND_EXIT`]
    pub kind: u8,

    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 3],

    /// Kernel task id (low half of `bpf_get_current_pid_tgid`)
    pub pid: u32,

    /// Kernel thread group id (high half of `bpf_get_current_pid_tgid`)
    pub tgid: u32,

    /// `bpf_ktime_get_ns()` at capture
    pub timestamp_ns: u64,
}

/// Revision 2: function identified by name, goroutine id added
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventRecordV2 {
    /// Function symbol, NUL-padded (truncated if longer than [`FUNC_NAME_LEN`])
    pub func_name: [u8; FUNC_NAME_LEN],

    /// [`KIND_ENTRY`] or [`KIND_EXIT`]
    pub kind: u8,

    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 3],

    pub pid: u32,

    pub tgid: u32,

    /// Keeps `goid` 8-byte aligned
    #[allow(clippy::pub_underscore_fields)]
    pub _padding2: [u8; 4],

    /// Goroutine id, 0 if the probe could not resolve it
    pub goid: i64,

    pub timestamp_ns: u64,
}

impl Default for EventRecordV2 {
    fn default() -> Self {
        Self {
            func_name: [0; FUNC_NAME_LEN],
            kind: KIND_ENTRY,
            _padding: [0; 3],
            pid: 0,
            tgid: 0,
            _padding2: [0; 4],
            goid: 0,
            timestamp_ns: 0,
        }
    }
}

/// Revision 3: function code, goroutine id and the morestack continuation flag
///
/// **Memory Layout**: 32 bytes, no implicit padding
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventRecordV3 {
    /// Function code assigned by the target specification
    pub func_id: u32,

    /// [`KIND_ENTRY`] or [`KIND_EXIT`]
    pub kind: u8,

    /// Non-zero when the goroutine stack was grown (`runtime.morestack`) around this event
    pub continuation: u8,

    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 2],

    pub pid: u32,

    pub tgid: u32,

    /// Goroutine id, 0 if the probe could not resolve it
    pub goid: i64,

    pub timestamp_ns: u64,
}

// ============================================================================
// Probe Sites
// ============================================================================

/// Value stored in `PROBE_SITES`, keyed by the runtime address of the probe
///
/// One uprobe program is attached at every entry and exit location; on a hit
/// it looks up its own instruction pointer here to learn which function and
/// which edge fired.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProbeSite {
    pub func_id: u32,

    /// [`KIND_ENTRY`] or [`KIND_EXIT`]
    pub kind: u8,

    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 3],
}

impl ProbeSite {
    #[must_use]
    pub const fn entry(func_id: u32) -> Self {
        Self { func_id, kind: KIND_ENTRY, _padding: [0; 3] }
    }

    #[must_use]
    pub const fn exit(func_id: u32) -> Self {
        Self { func_id, kind: KIND_EXIT, _padding: [0; 3] }
    }
}

#[cfg(feature = "user")]
use aya::Pod;

// Pod marks the types as plain bytes for map access from userspace
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for ProbeSite {}
