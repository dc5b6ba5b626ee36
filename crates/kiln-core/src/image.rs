//! Host pixel buffers.
//!
//! A [`PixelBuffer`] is built once and never mutated: dimensions and samples
//! are fixed at construction. Device images always use a 4-channel float
//! texel, so [`expand_to_rgba`] and [`collapse_from_rgba`] convert between
//! the buffer's channel count and that layout.

use std::fmt;

use crate::error::{Error, Result};
use crate::generate::SyntheticGenerator;

/// Channels per device texel.
pub const RGBA_CHANNELS: u32 = 4;

// ============================================================================
// Extent
// ============================================================================

/// Width and height of a 2D resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Extent {
    /// Creates an extent.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ============================================================================
// Sample types
// ============================================================================

/// Numeric sample type of a [`PixelBuffer`].
pub trait Sample: Copy + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Largest absolute difference still treated as equal.
    const EPSILON: f64;
    /// Short type name for diagnostics.
    const NAME: &'static str;

    /// Converts from the generator's value domain.
    fn from_f64(value: f64) -> Self;

    /// Widens to `f64` for comparison.
    fn to_f64(self) -> f64;
}

impl Sample for f32 {
    const EPSILON: f64 = 0.01;
    const NAME: &'static str = "f32";

    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Sample for u8 {
    const EPSILON: f64 = 0.0;
    const NAME: &'static str = "u8";

    fn from_f64(value: f64) -> Self {
        value.round().clamp(0.0, 255.0) as u8
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

// ============================================================================
// PixelBuffer
// ============================================================================

/// Immutable host image of `width * height * channels` samples, row-major,
/// channels interleaved.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelBuffer<T: Sample = f32> {
    width: u32,
    height: u32,
    channels: u32,
    data: Vec<T>,
}

impl<T: Sample> PixelBuffer<T> {
    /// Builds a buffer filled by `generator`.
    pub fn generate(width: u32, height: u32, channels: u32, generator: &SyntheticGenerator) -> Result<Self> {
        let len = checked_len(width, height, channels)?;
        Ok(Self {
            width,
            height,
            channels,
            data: generator.fill(len),
        })
    }

    /// Wraps existing samples. The length must match the dimensions.
    pub fn from_vec(width: u32, height: u32, channels: u32, data: Vec<T>) -> Result<Self> {
        let expected = checked_len(width, height, channels)?;
        if data.len() != expected {
            return Err(Error::BufferSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// Width in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Channels per pixel.
    #[inline]
    pub fn channels(&self) -> u32 {
        self.channels
    }

    /// 2D extent.
    pub fn extent(&self) -> Extent {
        Extent::new(self.width, self.height)
    }

    /// Total sample count.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always false for a constructed buffer; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Samples.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Samples widened to `f32`, the device texel type.
    pub fn to_f32(&self) -> Vec<f32> {
        self.data.iter().map(|v| v.to_f64() as f32).collect()
    }
}

fn checked_len(width: u32, height: u32, channels: u32) -> Result<usize> {
    if width == 0 || height == 0 || channels == 0 {
        return Err(Error::InvalidDimensions {
            width,
            height,
            channels,
        });
    }
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(channels as usize))
        .ok_or(Error::InvalidDimensions {
            width,
            height,
            channels,
        })
}

// ============================================================================
// RGBA packing
// ============================================================================

/// Packs `channels`-interleaved samples into RGBA texels. Missing channels
/// are zero.
pub fn expand_to_rgba(data: &[f32], channels: u32) -> Result<Vec<f32>> {
    let c = check_channels(data.len(), channels)?;
    if c == RGBA_CHANNELS as usize {
        return Ok(data.to_vec());
    }

    let pixels = data.len() / c;
    let mut out = vec![0.0f32; pixels * RGBA_CHANNELS as usize];
    for (src, dst) in data.chunks_exact(c).zip(out.chunks_exact_mut(RGBA_CHANNELS as usize)) {
        dst[..c].copy_from_slice(src);
    }
    Ok(out)
}

/// Inverse of [`expand_to_rgba`]: keeps the first `channels` of each texel.
pub fn collapse_from_rgba(rgba: &[f32], channels: u32) -> Result<Vec<f32>> {
    let c = check_channels(0, channels)?;
    if rgba.len() % RGBA_CHANNELS as usize != 0 {
        return Err(Error::BufferSizeMismatch {
            expected: rgba.len().next_multiple_of(RGBA_CHANNELS as usize),
            actual: rgba.len(),
        });
    }
    if c == RGBA_CHANNELS as usize {
        return Ok(rgba.to_vec());
    }

    Ok(rgba
        .chunks_exact(RGBA_CHANNELS as usize)
        .flat_map(|texel| texel[..c].iter().copied())
        .collect())
}

fn check_channels(len: usize, channels: u32) -> Result<usize> {
    if channels == 0 || channels > RGBA_CHANNELS {
        return Err(Error::UnsupportedChannels(channels));
    }
    let c = channels as usize;
    if len % c != 0 {
        return Err(Error::BufferSizeMismatch {
            expected: len.next_multiple_of(c),
            actual: len,
        });
    }
    Ok(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_dimensions() {
        let img: PixelBuffer = PixelBuffer::generate(8, 8, 4, &SyntheticGenerator::default()).unwrap();
        assert_eq!(img.width(), 8);
        assert_eq!(img.height(), 8);
        assert_eq!(img.channels(), 4);
        assert_eq!(img.len(), 256);
        assert_eq!(img.extent(), Extent::new(8, 8));
    }

    #[test]
    fn test_single_pixel() {
        let img: PixelBuffer<u8> = PixelBuffer::generate(1, 1, 1, &SyntheticGenerator::default()).unwrap();
        assert_eq!(img.len(), 1);
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let generator = SyntheticGenerator::default();
        for (w, h, c) in [(0, 8, 4), (8, 0, 4), (8, 8, 0)] {
            let err = PixelBuffer::<f32>::generate(w, h, c, &generator).unwrap_err();
            assert_eq!(err, Error::InvalidDimensions { width: w, height: h, channels: c });
        }
    }

    #[test]
    fn test_from_vec_length_checked() {
        let err = PixelBuffer::from_vec(2, 2, 3, vec![0.0f32; 11]).unwrap_err();
        assert_eq!(err, Error::BufferSizeMismatch { expected: 12, actual: 11 });
        assert!(PixelBuffer::from_vec(2, 2, 3, vec![0.0f32; 12]).is_ok());
    }

    #[test]
    fn test_buffers_are_reproducible() {
        let generator = SyntheticGenerator::default();
        let a: PixelBuffer = PixelBuffer::generate(4, 4, 3, &generator).unwrap();
        let b: PixelBuffer = PixelBuffer::generate(4, 4, 3, &generator).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_u8_to_f32() {
        let img = PixelBuffer::from_vec(1, 1, 2, vec![3u8, 255]).unwrap();
        assert_eq!(img.to_f32(), vec![3.0, 255.0]);
    }

    #[test]
    fn test_expand_collapse_rgb() {
        let rgb = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let rgba = expand_to_rgba(&rgb, 3).unwrap();
        assert_eq!(rgba, vec![1.0, 2.0, 3.0, 0.0, 4.0, 5.0, 6.0, 0.0]);
        assert_eq!(collapse_from_rgba(&rgba, 3).unwrap(), rgb);
    }

    #[test]
    fn test_expand_collapse_all_channel_counts() {
        for c in 1..=RGBA_CHANNELS {
            let data: Vec<f32> = (0..(5 * c)).map(|v| v as f32).collect();
            let rgba = expand_to_rgba(&data, c).unwrap();
            assert_eq!(rgba.len(), 5 * RGBA_CHANNELS as usize);
            assert_eq!(collapse_from_rgba(&rgba, c).unwrap(), data);
        }
    }

    #[test]
    fn test_too_many_channels() {
        assert_eq!(expand_to_rgba(&[0.0; 5], 5).unwrap_err(), Error::UnsupportedChannels(5));
        assert_eq!(collapse_from_rgba(&[0.0; 4], 0).unwrap_err(), Error::UnsupportedChannels(0));
    }

    #[test]
    fn test_ragged_input() {
        assert!(matches!(
            expand_to_rgba(&[0.0; 5], 3),
            Err(Error::BufferSizeMismatch { expected: 6, actual: 5 })
        ));
        assert!(matches!(
            collapse_from_rgba(&[0.0; 6], 3),
            Err(Error::BufferSizeMismatch { expected: 8, actual: 6 })
        ));
    }
}
