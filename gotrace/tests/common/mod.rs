//! Mock probe backend and record transport shared by the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gotrace::consumer::{PollStatus, RecordSource};
use gotrace::domain::CaptureError;
use gotrace::lifecycle::Cancellation;
use gotrace::probes::{FunctionTarget, ProbeBackend, TargetSpec};

/// Wire bytes of a revision 3 record
pub fn v3_record(func_id: u32, kind: u8, pid: u32, tgid: u32, goid: i64, timestamp_ns: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(&func_id.to_le_bytes());
    bytes.push(kind);
    bytes.push(0); // continuation
    bytes.extend_from_slice(&[0, 0]);
    bytes.extend_from_slice(&pid.to_le_bytes());
    bytes.extend_from_slice(&tgid.to_le_bytes());
    bytes.extend_from_slice(&goid.to_le_bytes());
    bytes.extend_from_slice(&timestamp_ns.to_le_bytes());
    bytes
}

/// Wire bytes of a revision 1 record
pub fn v1_record(func_id: u32, kind: u8, pid: u32, tgid: u32, timestamp_ns: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(24);
    bytes.extend_from_slice(&func_id.to_le_bytes());
    bytes.push(kind);
    bytes.extend_from_slice(&[0, 0, 0]);
    bytes.extend_from_slice(&pid.to_le_bytes());
    bytes.extend_from_slice(&tgid.to_le_bytes());
    bytes.extend_from_slice(&timestamp_ns.to_le_bytes());
    bytes
}

/// `count` entry records with function ids `first..first + count`
pub fn numbered_records(first: u32, count: u32) -> Vec<Vec<u8>> {
    (first..first + count)
        .map(|id| v3_record(id, 0, 4242, 4200, 7, 1_000 + u64::from(id)))
        .collect()
}

pub fn sample_targets() -> TargetSpec {
    TargetSpec {
        binary: PathBuf::from("/srv/app/server"),
        pid: None,
        functions: vec![
            FunctionTarget { id: 0, symbol: "main.main".into(), address: 0x1000, exit_offsets: vec![0x40] },
            FunctionTarget {
                id: 1,
                symbol: "main.handle".into(),
                address: 0x2000,
                exit_offsets: vec![0x18, 0x30],
            },
        ],
    }
}

/// In-memory ring buffer stand-in
#[derive(Default)]
pub struct MockSource {
    batches: VecDeque<Vec<Vec<u8>>>,
    drained_batches: usize,
    /// Always have more records than one poll may take
    endless: bool,
    /// Largest `max_records` seen
    pub max_requested: usize,
    /// Poll fault (raw OS error) once the batches run out
    fault: Option<i32>,
    /// Report an interrupted wait once the batches run out
    interrupt_when_empty: bool,
    /// Request cancellation once the batches run out
    cancel_when_empty: Option<Cancellation>,
    /// Request cancellation while draining batch `n`, as a signal arriving mid-poll would
    cancel_during: Option<(usize, Cancellation)>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn batch(mut self, records: Vec<Vec<u8>>) -> Self {
        self.batches.push_back(records);
        self
    }

    /// A producer that never lets the ring run dry
    #[must_use]
    pub fn endless(mut self) -> Self {
        self.endless = true;
        self
    }

    #[must_use]
    pub fn fault_when_empty(mut self, errno: i32) -> Self {
        self.fault = Some(errno);
        self
    }

    #[must_use]
    pub fn interrupt_when_empty(mut self) -> Self {
        self.interrupt_when_empty = true;
        self
    }

    #[must_use]
    pub fn cancel_when_empty(mut self, cancel: &Cancellation) -> Self {
        self.cancel_when_empty = Some(cancel.clone());
        self
    }

    #[must_use]
    pub fn cancel_during(mut self, batch: usize, cancel: &Cancellation) -> Self {
        self.cancel_during = Some((batch, cancel.clone()));
        self
    }
}

impl RecordSource for MockSource {
    async fn poll<F>(
        &mut self,
        timeout: Duration,
        max_records: usize,
        mut on_record: F,
    ) -> Result<PollStatus, CaptureError>
    where
        F: FnMut(&[u8]) -> Result<(), CaptureError>,
    {
        self.max_requested = self.max_requested.max(max_records);

        let next = if self.endless {
            let first = u32::try_from(self.drained_batches * max_records).unwrap();
            Some(numbered_records(first, u32::try_from(max_records).unwrap()))
        } else {
            self.batches.pop_front()
        };

        if let Some(mut batch) = next {
            let index = self.drained_batches;
            self.drained_batches += 1;

            if batch.len() > max_records {
                self.batches.push_front(batch.split_off(max_records));
            }

            for (i, bytes) in batch.iter().enumerate() {
                if i == batch.len() / 2 {
                    if let Some((n, cancel)) = &self.cancel_during {
                        if *n == index {
                            cancel.cancel();
                        }
                    }
                }
                on_record(bytes)?;
            }
            return Ok(PollStatus::Drained(batch.len()));
        }

        if let Some(errno) = self.fault {
            return Err(CaptureError::Poll(io::Error::from_raw_os_error(errno)));
        }
        if self.interrupt_when_empty {
            return Ok(PollStatus::Interrupted);
        }
        if let Some(ref cancel) = self.cancel_when_empty {
            cancel.cancel();
        }
        tokio::time::sleep(timeout).await;
        Ok(PollStatus::Drained(0))
    }
}

/// Backend operation a test can make fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    RaiseLimits,
    Load,
    Attach,
    OpenSource,
}

/// Ordered log of backend calls, shared with the test after the backend moves
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<&'static str>>>);

impl CallLog {
    fn push(&self, call: &'static str) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| **c == call).count()
    }
}

#[derive(Debug)]
pub struct MockBundle;

pub struct MockBackend {
    log: CallLog,
    fail_at: Option<Step>,
    source: Option<MockSource>,
}

impl MockBackend {
    pub fn new(source: MockSource) -> (Self, CallLog) {
        let log = CallLog::default();
        (Self { log: log.clone(), fail_at: None, source: Some(source) }, log)
    }

    pub fn failing_at(step: Step) -> (Self, CallLog) {
        let (mut backend, log) = Self::new(MockSource::new());
        backend.fail_at = Some(step);
        (backend, log)
    }

    fn fails(&self, step: Step) -> bool {
        self.fail_at == Some(step)
    }
}

impl ProbeBackend for MockBackend {
    type Bundle = MockBundle;
    type Source = MockSource;

    fn raise_limits(&mut self) -> Result<(), CaptureError> {
        self.log.push("raise_limits");
        if self.fails(Step::RaiseLimits) {
            return Err(CaptureError::LimitRaise(io::Error::from_raw_os_error(libc::EPERM)));
        }
        Ok(())
    }

    fn load(&mut self) -> Result<MockBundle, CaptureError> {
        self.log.push("load");
        if self.fails(Step::Load) {
            return Err(CaptureError::BundleLoad("verifier rejected gotrace_probe".into()));
        }
        Ok(MockBundle)
    }

    fn attach(&mut self, _bundle: &mut MockBundle, targets: &TargetSpec) -> Result<usize, CaptureError> {
        self.log.push("attach");
        if self.fails(Step::Attach) {
            return Err(CaptureError::ProbeAttach {
                probe: "main.handle+0x18".into(),
                binary: targets.binary.display().to_string(),
                error: "symbol not found".into(),
            });
        }
        Ok(targets.site_count())
    }

    fn open_source(&mut self, _bundle: &mut MockBundle) -> Result<MockSource, CaptureError> {
        self.log.push("open_source");
        if self.fails(Step::OpenSource) {
            return Err(CaptureError::BundleLoad("EVENTS map not found".into()));
        }
        self.source.take().ok_or_else(|| CaptureError::BundleLoad("source opened twice".into()))
    }

    fn close_source(&mut self, source: MockSource) {
        self.log.push("close_source");
        drop(source);
    }

    fn detach(&mut self, _bundle: &mut MockBundle) {
        self.log.push("detach");
    }

    fn destroy(&mut self, bundle: MockBundle) {
        self.log.push("destroy");
        drop(bundle);
    }
}
