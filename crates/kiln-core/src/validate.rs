//! Comparison of retrieved device output against the reference buffer.
//!
//! The check is element-wise: `|got[i] - expected[i]| <= epsilon` for every
//! `i`. Epsilon defaults per sample type ([`Sample::EPSILON`]): `0.01` for
//! `f32`, exact for `u8`. Besides the verdict, [`validate`] collects the same
//! difference statistics an image diff reports (max, mean, RMS).

use std::fmt;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::image::Sample;

/// Largest accepted absolute difference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    epsilon: f64,
}

impl Tolerance {
    /// Explicit epsilon. Negative values are clamped to zero.
    pub fn new(epsilon: f64) -> Self {
        Self {
            epsilon: epsilon.max(0.0),
        }
    }

    /// Default epsilon for sample type `T`.
    pub fn for_sample<T: Sample>() -> Self {
        Self::new(T::EPSILON)
    }

    /// Epsilon value.
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Whether `expected` and `got` are equal within this tolerance.
    #[inline]
    pub fn accepts(&self, expected: f64, got: f64) -> bool {
        (got - expected).abs() <= self.epsilon
    }
}

/// First element outside tolerance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mismatch {
    /// Sample index.
    pub index: usize,
    /// Reference value.
    pub expected: f64,
    /// Retrieved value.
    pub got: f64,
}

/// Outcome of a validation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    /// Number of compared samples.
    pub len: usize,
    /// Samples outside tolerance.
    pub mismatches: usize,
    /// Largest absolute difference.
    pub max_diff: f64,
    /// Mean absolute difference.
    pub mean_diff: f64,
    /// Root mean square difference.
    pub rms_diff: f64,
    /// Epsilon the comparison used.
    pub epsilon: f64,
    /// First failing sample, if any.
    pub first_mismatch: Option<Mismatch>,
}

impl ValidationReport {
    /// True when no sample is outside tolerance.
    pub fn passed(&self) -> bool {
        self.mismatches == 0
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} samples, max diff {:.6}, mean {:.6}, rms {:.6}",
            self.len, self.max_diff, self.mean_diff, self.rms_diff
        )?;
        if let Some(m) = self.first_mismatch {
            write!(
                f,
                ", {} outside eps {} (first at [{}]: expected {}, got {})",
                self.mismatches, self.epsilon, m.index, m.expected, m.got
            )?;
        }
        Ok(())
    }
}

/// Compares `got` against `expected` and returns the full report.
///
/// Fails only when the lengths differ; a tolerance violation is reported
/// through [`ValidationReport::passed`].
pub fn validate<T: Sample>(expected: &[T], got: &[T], tolerance: Tolerance) -> Result<ValidationReport> {
    if expected.len() != got.len() {
        return Err(Error::LengthMismatch {
            expected: expected.len(),
            got: got.len(),
        });
    }

    let mut max_diff = 0.0f64;
    let mut sum_diff = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut mismatches = 0usize;
    let mut first_mismatch = None;

    for (index, (e, g)) in expected.iter().zip(got).enumerate() {
        let (e, g) = (e.to_f64(), g.to_f64());
        let diff = (g - e).abs();
        max_diff = max_diff.max(diff);
        sum_diff += diff;
        sum_sq += diff * diff;

        // NaN never compares within tolerance.
        if !tolerance.accepts(e, g) {
            trace!(index, expected = e, got = g, "sample outside tolerance");
            mismatches += 1;
            if first_mismatch.is_none() {
                first_mismatch = Some(Mismatch { index, expected: e, got: g });
            }
        }
    }

    let n = expected.len().max(1) as f64;
    let report = ValidationReport {
        len: expected.len(),
        mismatches,
        max_diff,
        mean_diff: sum_diff / n,
        rms_diff: (sum_sq / n).sqrt(),
        epsilon: tolerance.epsilon(),
        first_mismatch,
    };
    debug!(sample = T::NAME, %report, "validated");
    Ok(report)
}

/// Boolean form of [`validate`]: false on length mismatch or any sample
/// outside tolerance.
pub fn compare<T: Sample>(expected: &[T], got: &[T], tolerance: Tolerance) -> bool {
    validate(expected, got, tolerance)
        .map(|r| r.passed())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identical_passes() {
        let data = vec![1.0f32, 2.0, 3.0];
        let report = validate(&data, &data, Tolerance::for_sample::<f32>()).unwrap();
        assert!(report.passed());
        assert_eq!(report.len, 3);
        assert_eq!(report.max_diff, 0.0);
    }

    #[test]
    fn test_f32_within_epsilon() {
        let expected = [10.0f32, 20.0];
        let got = [10.005f32, 19.995];
        assert!(compare(&expected, &got, Tolerance::for_sample::<f32>()));
    }

    #[test]
    fn test_f32_outside_epsilon() {
        let expected = [10.0f32, 20.0, 30.0];
        let got = [10.0f32, 20.5, 31.0];
        let report = validate(&expected, &got, Tolerance::for_sample::<f32>()).unwrap();
        assert!(!report.passed());
        assert_eq!(report.mismatches, 2);
        let first = report.first_mismatch.unwrap();
        assert_eq!(first.index, 1);
        assert_relative_eq!(report.max_diff, 1.0);
        assert_relative_eq!(report.mean_diff, 0.5);
    }

    #[test]
    fn test_u8_is_exact() {
        assert!(compare(&[1u8, 2, 3], &[1u8, 2, 3], Tolerance::for_sample::<u8>()));
        assert!(!compare(&[1u8, 2, 3], &[1u8, 2, 4], Tolerance::for_sample::<u8>()));
    }

    #[test]
    fn test_length_mismatch() {
        let err = validate(&[1.0f32, 2.0], &[1.0f32], Tolerance::for_sample::<f32>()).unwrap_err();
        assert_eq!(err, Error::LengthMismatch { expected: 2, got: 1 });
        assert!(!compare(&[1.0f32, 2.0], &[1.0f32], Tolerance::new(1e9)));
    }

    #[test]
    fn test_nan_fails() {
        assert!(!compare(&[1.0f32], &[f32::NAN], Tolerance::new(1e9)));
    }

    #[test]
    fn test_rms() {
        let report = validate(&[0.0f32, 0.0], &[3.0f32, 4.0], Tolerance::new(10.0)).unwrap();
        assert!(report.passed());
        assert_relative_eq!(report.rms_diff, (12.5f64).sqrt());
    }

    #[test]
    fn test_negative_epsilon_clamped() {
        assert_eq!(Tolerance::new(-1.0).epsilon(), 0.0);
    }

    #[test]
    fn test_report_display() {
        let report = validate(&[0.0f32], &[1.0f32], Tolerance::new(0.01)).unwrap();
        let text = report.to_string();
        assert!(text.contains("max diff 1.000000"));
        assert!(text.contains("first at [0]"));
    }
}
