//! # Probe Attachment
//!
//! Everything between "which functions should be traced" and "a ring buffer
//! is producing records":
//!
//! - [`targets`]: the target specification (functions, entry and exit sites)
//! - [`symbols`]: discover targets from a Go binary's symbol table
//! - [`attach`]: the aya-backed [`ProbeBackend`]
//!
//! The [`ProbeBackend`] trait is the seam the lifecycle controller drives, so
//! a capture can run against a mock transport in tests.

pub mod attach;
pub mod symbols;
pub mod targets;

pub use attach::{AyaBackend, DEFAULT_BUNDLE_PATH};
pub use symbols::{discover_targets, DEFAULT_PREFIX};
pub use targets::{FunctionTarget, SiteSpec, TargetSpec};

use crate::consumer::RecordSource;
use crate::domain::CaptureError;

/// Load / attach / release operations on a probe bundle
///
/// Acquisition steps are fallible and fatal; release steps never fail (they
/// log) and are only called for resources that were actually acquired.
pub trait ProbeBackend {
    /// A loaded and verified probe bundle
    type Bundle;
    /// The record transport opened from a bundle
    type Source: RecordSource;

    /// Lift process limits needed to pin shared kernel memory
    ///
    /// # Errors
    /// Returns [`CaptureError::LimitRaise`] if the limit cannot be raised
    fn raise_limits(&mut self) -> Result<(), CaptureError>;

    /// Load and verify the probe bundle
    ///
    /// # Errors
    /// Returns [`CaptureError::BundleLoad`] on any load or verifier failure
    fn load(&mut self) -> Result<Self::Bundle, CaptureError>;

    /// Attach every entry and exit site of `targets`, returning the probe count
    ///
    /// All-or-nothing: on error nothing is left attached.
    ///
    /// # Errors
    /// Returns [`CaptureError::ProbeAttach`] for the first site that fails
    fn attach(&mut self, bundle: &mut Self::Bundle, targets: &TargetSpec) -> Result<usize, CaptureError>;

    /// Open the record transport of an attached bundle
    ///
    /// # Errors
    /// Returns an error if the transport cannot be opened
    fn open_source(&mut self, bundle: &mut Self::Bundle) -> Result<Self::Source, CaptureError>;

    /// Release the record transport
    fn close_source(&mut self, source: Self::Source) {
        drop(source);
    }

    /// Detach every probe attached by [`attach`](Self::attach)
    fn detach(&mut self, bundle: &mut Self::Bundle);

    /// Unload the bundle
    fn destroy(&mut self, bundle: Self::Bundle);
}
