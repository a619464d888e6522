//! Domain model for gotrace
//!
//! Core newtypes and the error taxonomy shared by every stage of a capture.

pub mod errors;
pub mod types;

pub use errors::{CaptureError, DecodeError};
pub use types::Pid;
