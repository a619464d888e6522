//! # Ring Buffer Consumer
//!
//! Drains capture records from the transport and pushes each one through
//! decode → sink, in dequeue order.
//!
//! ## Polling Contract
//!
//! [`RecordSource::poll`] waits at most `timeout` for data and then hands
//! every record currently buffered to the callback, synchronously. Two
//! outcomes are not faults:
//!
//! - `Drained(0)`: nothing arrived within the timeout (idle)
//! - `Interrupted`: the wait was interrupted (`EINTR`), treated as a stop request
//!
//! Anything else is fatal. A record taken off the ring reaches the callback
//! exactly once; cancellation is only observed between polls, never mid-drain.
//!
//! One poll hands over at most `max_records`, the number of records the ring
//! can hold. Producers refill the ring while it is being drained, so without
//! the bound a busy target could keep a single poll (and the loop around it)
//! going forever.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use aya::maps::{MapData, RingBuf};
use gotrace_common::EVENTS_RING_SIZE;
use log::{debug, info};
use tokio::io::unix::AsyncFd;

use crate::domain::{CaptureError, Pid};
use crate::lifecycle::Cancellation;
use crate::record::SchemaRevision;
use crate::sink::OutputSink;

/// Poll timeout: keeps the loop responsive to cancellation without spinning
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Non-fatal outcome of one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Number of records handed to the callback (0 when idle)
    Drained(usize),
    /// The wait was interrupted before any record was taken
    Interrupted,
}

/// Why the consume loop stopped without a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    Interrupted,
    DurationElapsed,
    TargetExited,
}

/// A bounded producer/consumer transport of fixed-size records
#[allow(async_fn_in_trait)]
pub trait RecordSource {
    /// Wait up to `timeout`, then hand up to `max_records` buffered records to `on_record`
    ///
    /// Records left over stay queued for the next poll, which then returns
    /// without waiting.
    ///
    /// # Errors
    /// Returns the first error from `on_record` (the drain stops there), or
    /// [`CaptureError::Poll`] if the transport faults.
    async fn poll<F>(
        &mut self,
        timeout: Duration,
        max_records: usize,
        on_record: F,
    ) -> Result<PollStatus, CaptureError>
    where
        F: FnMut(&[u8]) -> Result<(), CaptureError>;
}

/// Upper bound of records handed over by one poll: a full `EVENTS` ring
#[must_use]
pub fn records_per_poll(revision: SchemaRevision) -> usize {
    (EVENTS_RING_SIZE as usize / revision.record_size()).max(1)
}

/// Non-blocking access to the oldest queued record
trait RecordQueue {
    fn with_next<R>(&mut self, f: impl FnOnce(&[u8]) -> R) -> Option<R>;
}

impl RecordQueue for RingBuf<MapData> {
    fn with_next<R>(&mut self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        self.next().map(|item| f(&item))
    }
}

/// Hand at most `max_records` queued records to `on_record`, oldest first
fn drain_bounded<Q, F>(queue: &mut Q, max_records: usize, on_record: &mut F) -> Result<usize, CaptureError>
where
    Q: RecordQueue,
    F: FnMut(&[u8]) -> Result<(), CaptureError>,
{
    let mut drained = 0;
    while drained < max_records {
        match queue.with_next(|bytes| on_record(bytes)) {
            Some(result) => {
                result?;
                drained += 1;
            }
            None => break,
        }
    }
    Ok(drained)
}

/// The `EVENTS` BPF ring buffer, driven by tokio readiness
pub struct RingBufSource {
    ring: AsyncFd<RingBuf<MapData>>,
}

impl RingBufSource {
    /// Register the ring buffer with the tokio reactor
    ///
    /// # Errors
    /// Returns [`CaptureError::Io`] if the ring buffer fd cannot be registered
    pub fn new(ring: RingBuf<MapData>) -> Result<Self, CaptureError> {
        Ok(Self { ring: AsyncFd::new(ring)? })
    }
}

impl RecordSource for RingBufSource {
    async fn poll<F>(
        &mut self,
        timeout: Duration,
        max_records: usize,
        mut on_record: F,
    ) -> Result<PollStatus, CaptureError>
    where
        F: FnMut(&[u8]) -> Result<(), CaptureError>,
    {
        let mut guard = match tokio::time::timeout(timeout, self.ring.readable_mut()).await {
            Err(_elapsed) => return Ok(PollStatus::Drained(0)),
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {
                return Ok(PollStatus::Interrupted)
            }
            Ok(Err(e)) => return Err(CaptureError::Poll(e)),
            Ok(Ok(guard)) => guard,
        };

        let drained = drain_bounded(guard.get_inner_mut(), max_records, &mut on_record)?;
        if drained < max_records {
            // Ran dry; otherwise stay ready so the next poll picks up the rest
            guard.clear_ready();
        }

        Ok(PollStatus::Drained(drained))
    }
}

/// Runtime knobs of a capture
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Layout the probe bundle was built with
    pub revision: SchemaRevision,
    pub poll_timeout: Duration,
    /// Stop after this long (`None` = until cancelled)
    pub duration: Option<Duration>,
    /// Stop when this process disappears
    pub watch_pid: Option<Pid>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            revision: SchemaRevision::default(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            duration: None,
            watch_pid: None,
        }
    }
}

/// Counters of a finished consume loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeSummary {
    pub records: u64,
    pub polls: u64,
    pub elapsed: Duration,
    pub stop: StopReason,
}

/// Poll until cancelled, interrupted, a stop condition is met, or a fault
///
/// # Errors
/// Poll faults, decode length mismatches (protocol violation) and write
/// faults all end the loop with an error.
pub async fn consume<S, W>(
    source: &mut S,
    sink: &mut OutputSink<W>,
    cancel: &Cancellation,
    options: &CaptureOptions,
) -> Result<ConsumeSummary, CaptureError>
where
    S: RecordSource,
    W: Write,
{
    let started = Instant::now();
    let revision = options.revision;
    let max_records = records_per_poll(revision);
    let mut records = 0u64;
    let mut polls = 0u64;

    let stop = loop {
        if cancel.is_requested() {
            break StopReason::Cancelled;
        }
        if options.duration.is_some_and(|limit| started.elapsed() >= limit) {
            break StopReason::DurationElapsed;
        }
        if options.watch_pid.is_some_and(|pid| !pid.is_alive()) {
            break StopReason::TargetExited;
        }

        polls += 1;
        let status = source
            .poll(options.poll_timeout, max_records, |bytes| {
                let record = revision.decode(bytes)?;
                sink.emit(&record)
            })
            .await?;

        match status {
            PollStatus::Drained(0) => {}
            PollStatus::Drained(n) => {
                records += n as u64;
                debug!("poll #{polls}: {n} records ({records} total)");
            }
            PollStatus::Interrupted => break StopReason::Interrupted,
        }
    };

    info!("Consumer stopped ({stop:?}) after {records} records in {polls} polls");
    Ok(ConsumeSummary { records, polls, elapsed: started.elapsed(), stop })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Producer that refills faster than anyone can drain
    struct Endless {
        produced: u64,
    }

    impl RecordQueue for Endless {
        fn with_next<R>(&mut self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
            self.produced += 1;
            Some(f(&self.produced.to_le_bytes()))
        }
    }

    impl RecordQueue for VecDeque<Vec<u8>> {
        fn with_next<R>(&mut self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
            self.pop_front().map(|bytes| f(&bytes))
        }
    }

    #[test]
    fn test_drain_stops_at_bound_on_endless_producer() {
        let mut queue = Endless { produced: 0 };
        let mut seen = 0;
        let drained = drain_bounded(&mut queue, 100, &mut |_| {
            seen += 1;
            Ok(())
        })
        .unwrap();

        assert_eq!(drained, 100);
        assert_eq!(seen, 100);
        assert_eq!(queue.produced, 100);
    }

    #[test]
    fn test_drain_takes_everything_below_bound() {
        let mut queue: VecDeque<Vec<u8>> = (0u8..5).map(|b| vec![b]).collect();
        let mut order = Vec::new();
        let drained = drain_bounded(&mut queue, 100, &mut |bytes| {
            order.push(bytes[0]);
            Ok(())
        })
        .unwrap();

        assert_eq!(drained, 5);
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_leaves_remainder_queued() {
        let mut queue: VecDeque<Vec<u8>> = (0u8..5).map(|b| vec![b]).collect();
        let drained = drain_bounded(&mut queue, 3, &mut |_| Ok(())).unwrap();

        assert_eq!(drained, 3);
        assert_eq!(queue.front(), Some(&vec![3]));
    }

    #[test]
    fn test_drain_stops_at_first_callback_error() {
        let mut queue: VecDeque<Vec<u8>> = (0u8..5).map(|b| vec![b]).collect();
        let err = drain_bounded(&mut queue, 100, &mut |bytes| {
            if bytes[0] == 2 {
                return Err(CaptureError::OutputWrite(io::Error::from_raw_os_error(libc::ENOSPC)));
            }
            Ok(())
        })
        .unwrap_err();

        assert!(matches!(err, CaptureError::OutputWrite(_)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_records_per_poll_is_ring_capacity() {
        assert_eq!(records_per_poll(SchemaRevision::V1), 256 * 1024 / 24);
        assert_eq!(records_per_poll(SchemaRevision::V2), 256 * 1024 / 64);
        assert_eq!(records_per_poll(SchemaRevision::V3), 256 * 1024 / 32);
    }
}
