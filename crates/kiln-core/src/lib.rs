//! # kiln-core
//!
//! Host-side data for GPU round-trip checks.
//!
//! - [`PixelBuffer`] - immutable host image filled once by a seeded generator
//! - [`SyntheticGenerator`] - reproducible pseudo-random sample source
//! - [`validate`](mod@validate) - tolerance comparison of retrieved output
//!   against the reference buffer
//!
//! ## Crate Structure
//!
//! ```text
//! kiln-core (this crate)
//!    ^
//!    |
//!    +-- kiln-compute (session lifecycle, GPU backends)
//!    +-- kiln-cli (driver binary)
//! ```
//!
//! ## Example
//!
//! ```
//! use kiln_core::{PixelBuffer, SyntheticGenerator, Tolerance, validate};
//!
//! let image: PixelBuffer = PixelBuffer::generate(8, 8, 4, &SyntheticGenerator::default())?;
//! let report = validate::validate(image.data(), image.data(), Tolerance::for_sample::<f32>())?;
//! assert!(report.passed());
//! # Ok::<(), kiln_core::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod generate;
pub mod image;
pub mod validate;

pub use error::{Error, Result};
pub use generate::{DEFAULT_BOTTOM, DEFAULT_SEED, DEFAULT_TOP, SyntheticGenerator};
pub use image::{Extent, PixelBuffer, RGBA_CHANNELS, Sample, collapse_from_rgba, expand_to_rgba};
pub use validate::{Mismatch, Tolerance, ValidationReport, compare};
