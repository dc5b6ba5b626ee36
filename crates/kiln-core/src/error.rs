//! Error types for kiln-core.
//!
//! Everything in this crate is pure host computation, so the failure modes
//! are limited to shape problems: bad dimensions, buffers of the wrong
//! length, and channel layouts the fixed RGBA device format cannot hold.

use thiserror::Error;

/// Result type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by host-side buffer handling and validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Width, height and channel count must all be non-zero.
    #[error("invalid dimensions: {width}x{height}x{channels}")]
    InvalidDimensions {
        /// Requested width.
        width: u32,
        /// Requested height.
        height: u32,
        /// Requested channel count.
        channels: u32,
    },

    /// A sample vector does not hold `width * height * channels` values.
    #[error("buffer size mismatch: expected {expected}, got {actual}")]
    BufferSizeMismatch {
        /// Expected sample count.
        expected: usize,
        /// Actual sample count.
        actual: usize,
    },

    /// Channel count cannot be packed into a 4-channel texel.
    #[error("unsupported channel count {0} (device images hold at most 4)")]
    UnsupportedChannels(u32),

    /// Expected and retrieved sequences differ in length.
    #[error("length mismatch: expected {expected} samples, got {got}")]
    LengthMismatch {
        /// Reference length.
        expected: usize,
        /// Retrieved length.
        got: usize,
    },
}
