//! # Event Record Codec
//!
//! Decodes one fixed-size capture record, as delivered by the ring buffer,
//! into the canonical in-memory [`Record`].
//!
//! The wire carries no version tag. The active [`SchemaRevision`] is chosen
//! at startup and must match the layout the probe bundle was compiled with;
//! the only check possible is the exact record length.
//!
//! Adding a revision means adding a layout to `gotrace-common` and one arm
//! to [`SchemaRevision::decode`].

use std::fmt;
use std::mem::size_of;

use clap::ValueEnum;
use gotrace_common::{EventRecordV1, EventRecordV2, EventRecordV3, KIND_ENTRY};

use crate::domain::DecodeError;

/// Binary layout version of the capture records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, ValueEnum)]
pub enum SchemaRevision {
    /// Numeric function id, no goroutine id
    V1,
    /// Function name, goroutine id
    V2,
    /// Numeric function id, goroutine id, continuation flag
    #[default]
    V3,
}

impl fmt::Display for SchemaRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => f.write_str("v1"),
            Self::V2 => f.write_str("v2"),
            Self::V3 => f.write_str("v3"),
        }
    }
}

/// Whether the function was entered or left
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Entry,
    Exit,
}

impl EventKind {
    /// Wire `kind` byte; anything but 0 is an exit, as with a C `bool`
    #[must_use]
    pub fn from_wire(kind: u8) -> Self {
        if kind == KIND_ENTRY {
            Self::Entry
        } else {
            Self::Exit
        }
    }

    /// `0` for entry, `1` for exit
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Entry => 0,
            Self::Exit => 1,
        }
    }
}

/// Identifier of the instrumented function
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FunctionId {
    /// Code assigned by the target specification (revisions 1 and 3)
    Code(u32),
    /// Symbol name as captured by the probe (revision 2)
    Name(String),
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "{code}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// One function entry or exit observed in the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub function: FunctionId,
    pub kind: EventKind,
    pub process_id: u32,
    pub thread_group_id: u32,
    /// Goroutine id; `None` when the revision does not carry one
    pub execution_unit: Option<i64>,
    /// Producer clock, only ordered per producer thread
    pub timestamp_ns: u64,
    /// Stack was grown around this event; `None` when the revision does not carry it
    pub continuation: Option<bool>,
}

impl SchemaRevision {
    /// Exact wire size of one record
    #[must_use]
    pub const fn record_size(self) -> usize {
        match self {
            Self::V1 => size_of::<EventRecordV1>(),
            Self::V2 => size_of::<EventRecordV2>(),
            Self::V3 => size_of::<EventRecordV3>(),
        }
    }

    /// Decode one record
    ///
    /// # Errors
    /// Returns [`DecodeError::LengthMismatch`] if `bytes` is not exactly
    /// [`record_size`](Self::record_size) long.
    pub fn decode(self, bytes: &[u8]) -> Result<Record, DecodeError> {
        let expected = self.record_size();
        if bytes.len() != expected {
            return Err(DecodeError::LengthMismatch { revision: self, expected, actual: bytes.len() });
        }

        let record = match self {
            Self::V1 => {
                let raw: EventRecordV1 = read_record(bytes);
                Record {
                    function: FunctionId::Code(raw.func_id),
                    kind: EventKind::from_wire(raw.kind),
                    process_id: raw.pid,
                    thread_group_id: raw.tgid,
                    execution_unit: None,
                    timestamp_ns: raw.timestamp_ns,
                    continuation: None,
                }
            }
            Self::V2 => {
                let raw: EventRecordV2 = read_record(bytes);
                Record {
                    function: FunctionId::Name(function_name(&raw.func_name)),
                    kind: EventKind::from_wire(raw.kind),
                    process_id: raw.pid,
                    thread_group_id: raw.tgid,
                    execution_unit: Some(raw.goid),
                    timestamp_ns: raw.timestamp_ns,
                    continuation: None,
                }
            }
            Self::V3 => {
                let raw: EventRecordV3 = read_record(bytes);
                Record {
                    function: FunctionId::Code(raw.func_id),
                    kind: EventKind::from_wire(raw.kind),
                    process_id: raw.pid,
                    thread_group_id: raw.tgid,
                    execution_unit: Some(raw.goid),
                    timestamp_ns: raw.timestamp_ns,
                    continuation: Some(raw.continuation != 0),
                }
            }
        };

        Ok(record)
    }
}

/// Copy a wire record out of a possibly unaligned span
///
/// Callers must have checked `bytes.len() == size_of::<T>()`.
fn read_record<T: Copy>(bytes: &[u8]) -> T {
    debug_assert_eq!(bytes.len(), size_of::<T>());
    // SAFETY: the length was checked above, the layouts are #[repr(C)] made only of
    // integers and byte arrays (every bit pattern is valid), and read_unaligned
    // makes no alignment assumption about the ring buffer slot.
    #[allow(unsafe_code)]
    unsafe {
        std::ptr::read_unaligned(bytes.as_ptr().cast::<T>())
    }
}

fn function_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gotrace_common::{FUNC_NAME_LEN, KIND_EXIT};

    fn as_bytes<T: Copy>(value: &T) -> Vec<u8> {
        // SAFETY: test-only view of a #[repr(C)] value without implicit padding
        #[allow(unsafe_code)]
        let bytes = unsafe {
            std::slice::from_raw_parts(std::ptr::from_ref(value).cast::<u8>(), size_of::<T>())
        };
        bytes.to_vec()
    }

    fn sample_v3() -> EventRecordV3 {
        EventRecordV3 {
            func_id: 17,
            kind: KIND_EXIT,
            continuation: 1,
            _padding: [0; 2],
            pid: 4242,
            tgid: 4200,
            goid: 33,
            timestamp_ns: 1_000_000_123,
        }
    }

    #[test]
    fn test_decode_v1() {
        let raw = EventRecordV1 {
            func_id: 3,
            kind: KIND_ENTRY,
            _padding: [0; 3],
            pid: 10,
            tgid: 11,
            timestamp_ns: 99,
        };
        let record = SchemaRevision::V1.decode(&as_bytes(&raw)).unwrap();

        assert_eq!(record.function, FunctionId::Code(3));
        assert_eq!(record.kind, EventKind::Entry);
        assert_eq!((record.process_id, record.thread_group_id), (10, 11));
        assert_eq!(record.execution_unit, None);
        assert_eq!(record.continuation, None);
        assert_eq!(record.timestamp_ns, 99);
    }

    #[test]
    fn test_decode_v2_reads_name_up_to_nul() {
        let mut raw = EventRecordV2 { kind: KIND_EXIT, pid: 1, tgid: 2, goid: 7, timestamp_ns: 5, ..Default::default() };
        raw.func_name[..9].copy_from_slice(b"main.work");

        let record = SchemaRevision::V2.decode(&as_bytes(&raw)).unwrap();
        assert_eq!(record.function, FunctionId::Name("main.work".to_string()));
        assert_eq!(record.kind, EventKind::Exit);
        assert_eq!(record.execution_unit, Some(7));
    }

    #[test]
    fn test_decode_v2_name_fills_whole_field() {
        let raw = EventRecordV2 { func_name: [b'x'; FUNC_NAME_LEN], ..Default::default() };
        let record = SchemaRevision::V2.decode(&as_bytes(&raw)).unwrap();
        assert_eq!(record.function, FunctionId::Name("x".repeat(FUNC_NAME_LEN)));
    }

    #[test]
    fn test_decode_v3() {
        let record = SchemaRevision::V3.decode(&as_bytes(&sample_v3())).unwrap();

        assert_eq!(record.function, FunctionId::Code(17));
        assert_eq!(record.kind, EventKind::Exit);
        assert_eq!(record.process_id, 4242);
        assert_eq!(record.thread_group_id, 4200);
        assert_eq!(record.execution_unit, Some(33));
        assert_eq!(record.timestamp_ns, 1_000_000_123);
        assert_eq!(record.continuation, Some(true));
    }

    #[test]
    fn test_decode_is_deterministic() {
        let bytes = as_bytes(&sample_v3());
        assert_eq!(SchemaRevision::V3.decode(&bytes), SchemaRevision::V3.decode(&bytes));
    }

    #[test]
    fn test_decode_unaligned_span() {
        let mut buffer = vec![0u8; 1];
        buffer.extend(as_bytes(&sample_v3()));
        let record = SchemaRevision::V3.decode(&buffer[1..]).unwrap();
        assert_eq!(record.function, FunctionId::Code(17));
    }

    #[test]
    fn test_nonzero_kind_is_exit() {
        let mut raw = sample_v3();
        raw.kind = 0xff;
        let record = SchemaRevision::V3.decode(&as_bytes(&raw)).unwrap();
        assert_eq!(record.kind, EventKind::Exit);
    }

    #[test]
    fn test_any_other_length_is_rejected() {
        for revision in [SchemaRevision::V1, SchemaRevision::V2, SchemaRevision::V3] {
            let size = revision.record_size();
            for len in [0, 1, size - 1, size + 1, size * 2] {
                let err = revision.decode(&vec![0u8; len]).unwrap_err();
                assert_eq!(
                    err,
                    DecodeError::LengthMismatch { revision, expected: size, actual: len }
                );
            }
        }
    }

    #[test]
    fn test_revisions_disagree_on_size() {
        // A v3 record fed to a v1 consumer must fail rather than decode garbage
        let bytes = as_bytes(&sample_v3());
        assert!(SchemaRevision::V1.decode(&bytes).is_err());
        assert!(SchemaRevision::V2.decode(&bytes).is_err());
    }
}
