//! # Lifecycle & Cancellation
//!
//! Drives one capture from startup to exit:
//!
//! ```text
//! Init → LimitsRaised → BundleLoaded → Attached → StreamOpen → Polling
//!      → (Cancelled | Faulted) → Teardown → Done
//! ```
//!
//! Each forward step acquires one resource into its own slot of [`Session`].
//! [`Session::teardown`] empties the slots in reverse acquisition order; an
//! empty slot is skipped, so teardown can run from any state, any number of
//! times, and never releases anything twice.
//!
//! Cancellation is a process-wide flag. The signal listener is its only
//! writer and the poll loop its only reader.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use crate::consumer::{consume, CaptureOptions, ConsumeSummary};
use crate::domain::CaptureError;
use crate::probes::{ProbeBackend, TargetSpec};
use crate::sink::OutputSink;

/// Shared stop request flag
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Exit status of a run cut short by a second signal (128 + `SIGINT`)
pub const FORCED_EXIT_STATUS: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalAction {
    /// Wait for the poll loop to wind down
    Drain,
    /// Teardown is stuck or the user lost patience
    Exit,
}

/// First signal requests cancellation, any later one gives up on teardown
fn on_signal(cancel: &Cancellation) -> SignalAction {
    if cancel.is_requested() {
        return SignalAction::Exit;
    }
    cancel.cancel();
    SignalAction::Drain
}

/// Set `cancel` on the first `SIGINT` or `SIGTERM`
///
/// The listener only sets the flag; the poll loop notices it at its next
/// iteration boundary. A second signal exits the process at once with
/// [`FORCED_EXIT_STATUS`], skipping teardown and leaving the output file
/// possibly truncated.
///
/// # Errors
/// Returns an error if the signal handlers cannot be registered
pub fn install_signal_handlers(cancel: Cancellation) -> io::Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
            match on_signal(&cancel) {
                SignalAction::Drain => info!("Stopping capture, signal again to exit immediately"),
                SignalAction::Exit => {
                    error!("Second signal, exiting without teardown");
                    std::process::exit(FORCED_EXIT_STATUS);
                }
            }
        }
    }))
}

/// Remove the locked-memory limit so BPF maps can be pinned
///
/// Needed on kernels without memcg-based BPF memory accounting.
///
/// # Errors
/// Returns [`CaptureError::LimitRaise`] if `setrlimit` is refused
pub fn raise_memlock_limit() -> Result<(), CaptureError> {
    let rlim = libc::rlimit { rlim_cur: libc::RLIM_INFINITY, rlim_max: libc::RLIM_INFINITY };
    #[allow(unsafe_code)]
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        return Err(CaptureError::LimitRaise(io::Error::last_os_error()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Init,
    LimitsRaised,
    BundleLoaded,
    Attached,
    StreamOpen,
    Polling,
    /// Stopped without a fault (cancellation, interruption, stop condition)
    Cancelled,
    Faulted,
    Teardown,
    Done,
}

/// Resources of one capture, released in reverse acquisition order
pub struct Session<B: ProbeBackend> {
    backend: B,
    state: CaptureState,
    bundle: Option<B::Bundle>,
    attached: bool,
    sink: Option<OutputSink<File>>,
    source: Option<B::Source>,
}

impl<B: ProbeBackend> Session<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: CaptureState::Init,
            bundle: None,
            attached: false,
            sink: None,
            source: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> CaptureState {
        self.state
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Acquire every resource and poll until stopped
    ///
    /// Does not release anything: call [`teardown`](Self::teardown) afterwards
    /// whatever the result.
    ///
    /// # Errors
    /// Any startup or runtime fault; the state is left at `Faulted`.
    pub async fn run(
        &mut self,
        targets: &TargetSpec,
        output: &Path,
        options: &CaptureOptions,
        cancel: &Cancellation,
    ) -> Result<ConsumeSummary, CaptureError> {
        let result = self.acquire_and_poll(targets, output, options, cancel).await;
        self.state = match &result {
            Ok(_) => CaptureState::Cancelled,
            Err(e) => {
                error!("Capture failed in {:?}: {e}", self.state);
                CaptureState::Faulted
            }
        };
        result
    }

    async fn acquire_and_poll(
        &mut self,
        targets: &TargetSpec,
        output: &Path,
        options: &CaptureOptions,
        cancel: &Cancellation,
    ) -> Result<ConsumeSummary, CaptureError> {
        self.backend.raise_limits()?;
        self.state = CaptureState::LimitsRaised;

        let bundle = self.bundle.insert(self.backend.load()?);
        self.state = CaptureState::BundleLoaded;

        let probes = self.backend.attach(bundle, targets)?;
        self.attached = true;
        self.state = CaptureState::Attached;
        info!("✓ Attached {probes} probes to {}", targets.binary.display());

        let sink = self.sink.insert(OutputSink::create(output)?);
        self.state = CaptureState::StreamOpen;
        info!("✓ Writing records to {}", output.display());

        let source = self.source.insert(self.backend.open_source(bundle)?);
        self.state = CaptureState::Polling;

        consume(source, sink, cancel, options).await
    }

    /// Release everything acquired so far, newest first
    ///
    /// Every step runs even if an earlier one failed. Returns the first
    /// release fault (only closing the output stream can fail).
    ///
    /// # Errors
    /// Returns [`CaptureError::OutputWrite`] if the final flush of the output fails
    pub fn teardown(&mut self) -> Result<(), CaptureError> {
        self.state = CaptureState::Teardown;
        let mut fault = None;

        if let Some(source) = self.source.take() {
            self.backend.close_source(source);
            debug!("ring buffer released");
        }

        if let Some(sink) = self.sink.take() {
            match sink.close() {
                Ok(lines) => info!("Output closed ({lines} lines)"),
                Err(e) => {
                    error!("Failed to close output: {e}");
                    fault.get_or_insert(e);
                }
            }
        }

        if std::mem::take(&mut self.attached) {
            if let Some(bundle) = self.bundle.as_mut() {
                self.backend.detach(bundle);
                debug!("probes detached");
            }
        }

        if let Some(bundle) = self.bundle.take() {
            self.backend.destroy(bundle);
            debug!("probe bundle destroyed");
        }

        self.state = CaptureState::Done;
        fault.map_or(Ok(()), Err)
    }

    fn holds_resources(&self) -> bool {
        self.source.is_some() || self.sink.is_some() || self.attached || self.bundle.is_some()
    }
}

impl<B: ProbeBackend> Drop for Session<B> {
    fn drop(&mut self) {
        if self.holds_resources() {
            let _ = self.teardown();
        }
    }
}

/// Run a whole capture and always tear down
///
/// The first fault wins; a teardown fault is only reported when the capture
/// itself stopped cleanly.
///
/// # Errors
/// See [`Session::run`] and [`Session::teardown`]
pub async fn run_capture<B: ProbeBackend>(
    backend: B,
    targets: &TargetSpec,
    output: &Path,
    options: &CaptureOptions,
    cancel: &Cancellation,
) -> Result<ConsumeSummary, CaptureError> {
    let mut session = Session::new(backend);
    let result = session.run(targets, output, options, cancel).await;
    let released = session.teardown();

    match (result, released) {
        (Ok(summary), Ok(())) => Ok(summary),
        (Err(e), _) | (Ok(_), Err(e)) => Err(e),
    }
}
