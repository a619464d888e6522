//! # Output Sink
//!
//! Appends one line per decoded record:
//!
//! ```text
//! function;kind;pid;tgid;execution_unit;timestamp
//! 17;0;4242;4200;33;1000000123
//! ```
//!
//! `kind` is `0` for entry and `1` for exit, `execution_unit` is `0` when the
//! schema revision does not carry one. No header, no trailer. Lines are
//! flushed as they are written: the record rate is bounded by the target's
//! call rate, and a crash must not lose what was already dequeued.

use std::fs::File;
use std::io::{self, LineWriter, Write};
use std::path::Path;

use crate::domain::CaptureError;
use crate::record::Record;

/// Line-oriented record writer
pub struct OutputSink<W: Write> {
    writer: LineWriter<W>,
    lines: u64,
}

impl OutputSink<File> {
    /// Create (or truncate) the output file
    ///
    /// # Errors
    /// Returns [`CaptureError::OutputOpen`] if the file cannot be created
    pub fn create(path: &Path) -> Result<Self, CaptureError> {
        let file = File::create(path)
            .map_err(|source| CaptureError::OutputOpen { path: path.to_path_buf(), source })?;
        Ok(Self::new(file))
    }

    /// Flush and sync the file; consumes the sink so it is closed exactly once
    ///
    /// # Errors
    /// Returns [`CaptureError::OutputWrite`] if buffered data cannot be written out
    pub fn close(self) -> Result<u64, CaptureError> {
        let lines = self.lines;
        let file = self.writer.into_inner().map_err(|e| CaptureError::OutputWrite(e.into_error()))?;
        file.sync_data().map_err(CaptureError::OutputWrite)?;
        Ok(lines)
    }
}

impl<W: Write> OutputSink<W> {
    pub fn new(inner: W) -> Self {
        Self { writer: LineWriter::new(inner), lines: 0 }
    }

    /// Append one record
    ///
    /// # Errors
    /// Returns [`CaptureError::OutputWrite`] on any write fault; the record is not retried
    pub fn emit(&mut self, record: &Record) -> Result<(), CaptureError> {
        write_line(&mut self.writer, record).map_err(CaptureError::OutputWrite)?;
        self.lines += 1;
        Ok(())
    }

    /// Number of lines emitted so far
    #[must_use]
    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// Flush and hand back the underlying writer
    ///
    /// # Errors
    /// Returns [`CaptureError::OutputWrite`] if the final flush fails
    pub fn into_inner(self) -> Result<W, CaptureError> {
        self.writer.into_inner().map_err(|e| CaptureError::OutputWrite(e.into_error()))
    }
}

fn write_line<W: Write>(out: &mut W, record: &Record) -> io::Result<()> {
    writeln!(
        out,
        "{};{};{};{};{};{}",
        record.function,
        record.kind.as_u8(),
        record.process_id,
        record.thread_group_id,
        record.execution_unit.unwrap_or(0),
        record.timestamp_ns
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EventKind, FunctionId};

    fn record(function: FunctionId, kind: EventKind, goid: Option<i64>) -> Record {
        Record {
            function,
            kind,
            process_id: 4242,
            thread_group_id: 4200,
            execution_unit: goid,
            timestamp_ns: 1_000_000_123,
            continuation: None,
        }
    }

    #[test]
    fn test_field_order_and_delimiter() {
        let mut sink = OutputSink::new(Vec::new());
        sink.emit(&record(FunctionId::Code(17), EventKind::Exit, Some(33))).unwrap();

        let out = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert_eq!(out, "17;1;4242;4200;33;1000000123\n");
    }

    #[test]
    fn test_unknown_execution_unit_is_zero() {
        let mut sink = OutputSink::new(Vec::new());
        sink.emit(&record(FunctionId::Code(2), EventKind::Entry, None)).unwrap();

        let out = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert_eq!(out, "2;0;4242;4200;0;1000000123\n");
    }

    #[test]
    fn test_named_function() {
        let mut sink = OutputSink::new(Vec::new());
        sink.emit(&record(FunctionId::Name("main.main".into()), EventKind::Entry, Some(1)))
            .unwrap();

        let out = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert_eq!(out, "main.main;0;4242;4200;1;1000000123\n");
    }

    #[test]
    fn test_counts_lines() {
        let mut sink = OutputSink::new(Vec::new());
        for _ in 0..3 {
            sink.emit(&record(FunctionId::Code(1), EventKind::Entry, None)).unwrap();
        }
        assert_eq!(sink.lines(), 3);
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(libc::ENOSPC))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_fault_is_reported() {
        let mut sink = OutputSink::new(FailingWriter);
        let err = sink.emit(&record(FunctionId::Code(1), EventKind::Entry, None)).unwrap_err();

        assert!(matches!(err, CaptureError::OutputWrite(_)));
        assert_eq!(err.exit_code(), libc::ENOSPC);
        assert_eq!(sink.lines(), 0);
    }

    #[test]
    fn test_create_truncates_and_close_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.txt");
        std::fs::write(&path, "stale\n").unwrap();

        let mut sink = OutputSink::create(&path).unwrap();
        sink.emit(&record(FunctionId::Code(5), EventKind::Entry, None)).unwrap();
        assert_eq!(sink.close().unwrap(), 1);

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "5;0;4242;4200;0;1000000123\n");
    }

    #[test]
    fn test_create_in_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("output.txt");

        let err = OutputSink::create(&path).err().unwrap();
        assert!(matches!(err, CaptureError::OutputOpen { .. }));
        assert_eq!(err.exit_code(), libc::ENOENT);
    }
}
