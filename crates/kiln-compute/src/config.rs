//! Session configuration.
//!
//! # Environment Variables
//!
//! - `KILN_KERNEL_DIR` - directory holding the kernel files
//! - `KILN_SEED` - generator seed for the reference image
//! - `KILN_FENCE_TIMEOUT_MS` - upper bound of the device completion wait
//!
//! Unparseable values are ignored with a warning and the default is kept.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use kiln_core::{Extent, SyntheticGenerator, Tolerance};
use tracing::warn;

pub const ENV_KERNEL_DIR: &str = "KILN_KERNEL_DIR";
pub const ENV_SEED: &str = "KILN_SEED";
pub const ENV_FENCE_TIMEOUT_MS: &str = "KILN_FENCE_TIMEOUT_MS";

/// Default image: 8x8 RGBA.
pub const DEFAULT_WIDTH: u32 = 8;
pub const DEFAULT_HEIGHT: u32 = 8;
pub const DEFAULT_CHANNELS: u32 = 4;

/// Completion wait bound. Large enough to be effectively unbounded for a
/// single small dispatch.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_nanos(4_700_000_000);

/// Kernels shipped with the crate.
pub fn default_kernel_dir() -> PathBuf {
    PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/kernels"))
}

/// Everything one session needs besides the backend itself.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub generator: SyntheticGenerator,
    pub kernel_dir: PathBuf,
    pub fence_timeout: Duration,
    /// Overrides the per-sample-type epsilon.
    pub tolerance: Option<f64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            channels: DEFAULT_CHANNELS,
            generator: SyntheticGenerator::default(),
            kernel_dir: default_kernel_dir(),
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
            tolerance: None,
        }
    }
}

impl SessionConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    /// Applies overrides from any key/value source.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(ENV_KERNEL_DIR).filter(|s| !s.trim().is_empty()) {
            self.kernel_dir = PathBuf::from(dir);
        }
        if let Some(seed) = parse_var::<u64>(&lookup, ENV_SEED) {
            self.generator = SyntheticGenerator::new(seed)
                .with_bounds(self.generator.top(), self.generator.bottom());
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_FENCE_TIMEOUT_MS) {
            self.fence_timeout = Duration::from_millis(ms);
        }
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32, channels: u32) -> Self {
        self.width = width;
        self.height = height;
        self.channels = channels;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.generator = SyntheticGenerator::new(seed).with_bounds(self.generator.top(), self.generator.bottom());
        self
    }

    pub fn with_kernel_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.kernel_dir = dir.into();
        self
    }

    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    pub fn with_tolerance(mut self, epsilon: f64) -> Self {
        self.tolerance = Some(epsilon);
        self
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.width, self.height)
    }

    /// Tolerance for `f32` output unless overridden.
    pub fn tolerance(&self) -> Tolerance {
        match self.tolerance {
            Some(eps) => Tolerance::new(eps),
            None => Tolerance::for_sample::<f32>(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!((config.width, config.height, config.channels), (8, 8, 4));
        assert_eq!(config.fence_timeout, Duration::from_millis(4700));
        assert_eq!(config.generator.seed(), 0);
        assert!(config.kernel_dir.ends_with("kernels"));
        assert_eq!(config.tolerance().epsilon(), 0.01);
    }

    #[test]
    fn test_overrides_applied() {
        let config = SessionConfig::default().with_overrides(lookup(&[
            (ENV_KERNEL_DIR, "/tmp/k"),
            (ENV_SEED, "99"),
            (ENV_FENCE_TIMEOUT_MS, " 250 "),
        ]));
        assert_eq!(config.kernel_dir, PathBuf::from("/tmp/k"));
        assert_eq!(config.generator.seed(), 99);
        assert_eq!(config.generator.top(), 127.0);
        assert_eq!(config.fence_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_bad_overrides_ignored() {
        let config = SessionConfig::default().with_overrides(lookup(&[
            (ENV_KERNEL_DIR, "  "),
            (ENV_SEED, "abc"),
            (ENV_FENCE_TIMEOUT_MS, "-5"),
        ]));
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn test_builder() {
        let config = SessionConfig::default()
            .with_dimensions(1, 1, 1)
            .with_seed(5)
            .with_tolerance(0.5);
        assert_eq!(config.extent(), Extent::new(1, 1));
        assert_eq!(config.channels, 1);
        assert_eq!(config.generator.seed(), 5);
        assert_eq!(config.tolerance().epsilon(), 0.5);
    }
}
