//! Backend variants and the shared lifecycle contract.
//!
//! ```text
//! ComputeBackend (acquire, allocate, compile, dispatch, validate, teardown)
//!     +-- StreamBackend        (OpenCL, feature "opencl")
//!     +-- RasterComputeBackend (wgpu, feature "wgpu")
//!     +-- ExplicitBackend      (Vulkan via ash, feature "vulkan")
//! ```
//!
//! The set of variants is closed: [`AnyBackend`] forwards to the concrete
//! backend by tag. A variant whose cargo feature is off is represented by
//! [`AnyBackend::Disabled`] and fails at `acquire`.

mod detect;

#[cfg(feature = "vulkan")]
pub mod explicit;

#[cfg(feature = "wgpu")]
mod raster;

#[cfg(feature = "opencl")]
mod stream;

pub use detect::{BackendInfo, describe_backends, detect_backends};

#[cfg(feature = "vulkan")]
pub use explicit::ExplicitBackend;
#[cfg(feature = "wgpu")]
pub use raster::RasterComputeBackend;
#[cfg(feature = "opencl")]
pub use stream::StreamBackend;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use kiln_core::validate::validate;
use kiln_core::{Extent, PixelBuffer, Tolerance, ValidationReport};

use crate::config::SessionConfig;
use crate::kernel::KernelSource;
use crate::plan::{DispatchPlan, Staging};
use crate::{ComputeError, ComputeResult};

// ============================================================================
// Backend kinds
// ============================================================================

/// The three lifecycle variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Implicit memory, host pointers copied at image creation (OpenCL).
    Stream,
    /// Implicit memory, compute pass in a graphics API (wgpu).
    RasterCompute,
    /// Explicit memory types, staging images, barriers and fences (Vulkan).
    Explicit,
}

impl BackendKind {
    /// Driver run order.
    pub const ALL: [Self; 3] = [Self::Stream, Self::RasterCompute, Self::Explicit];

    /// Short name used on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::RasterCompute => "raster",
            Self::Explicit => "explicit",
        }
    }

    /// API behind the variant, used in pass lines.
    pub fn api_name(&self) -> &'static str {
        match self {
            Self::Stream => "opencl",
            Self::RasterCompute => "wgpu",
            Self::Explicit => "vulkan",
        }
    }

    /// Cargo feature that compiles the variant in.
    pub fn feature(&self) -> &'static str {
        match self {
            Self::Stream => "opencl",
            Self::RasterCompute => "wgpu",
            Self::Explicit => "vulkan",
        }
    }

    /// Staging hops the variant's dispatch plan contains.
    pub fn staging(&self) -> Staging {
        match self {
            Self::Stream => Staging::NONE,
            Self::RasterCompute => Staging::READBACK_ONLY,
            Self::Explicit => Staging::FULL,
        }
    }

    /// Whether the variant is compiled in.
    pub fn is_enabled(&self) -> bool {
        match self {
            Self::Stream => cfg!(feature = "opencl"),
            Self::RasterCompute => cfg!(feature = "wgpu"),
            Self::Explicit => cfg!(feature = "vulkan"),
        }
    }

    /// Whether the variant is compiled in and finds a capable device.
    pub fn is_available(&self) -> bool {
        match self {
            #[cfg(feature = "opencl")]
            Self::Stream => StreamBackend::is_available(),
            #[cfg(feature = "wgpu")]
            Self::RasterCompute => RasterComputeBackend::is_available(),
            #[cfg(feature = "vulkan")]
            Self::Explicit => ExplicitBackend::is_available(),
            #[allow(unreachable_patterns)]
            _ => false,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stream" | "opencl" | "cl" => Ok(Self::Stream),
            "raster" | "raster-compute" | "wgpu" | "gl" => Ok(Self::RasterCompute),
            "explicit" | "vulkan" | "vk" => Ok(Self::Explicit),
            other => Err(format!("unknown backend '{other}' (expected stream, raster or explicit)")),
        }
    }
}

// ============================================================================
// Step outputs
// ============================================================================

/// Chosen device and queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub kind: BackendKind,
    /// Device name as reported by the driver.
    pub name: String,
    /// Platform, adapter backend or API version.
    pub platform: String,
    /// Compute queue family, where the API exposes one.
    pub queue_family: Option<u32>,
}

/// Device images created for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSet {
    pub extent: Extent,
    /// Channel count of the host buffer (device texels are always RGBA).
    pub channels: u32,
    pub staging: Staging,
    /// Size of one RGBA32F device image.
    pub image_bytes: u64,
}

/// Compiled program bound to the 2-slot layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramInfo {
    pub entry_point: String,
    pub source: PathBuf,
    pub bindings: usize,
}

/// One-shot completion signal of a submitted dispatch.
///
/// Not `Clone`: readback takes it by value, so each token is consumed once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a dispatch result must be retrieved with its token"]
pub struct SyncToken {
    kind: BackendKind,
    submission: u64,
}

impl SyncToken {
    pub fn new(kind: BackendKind, submission: u64) -> Self {
        Self { kind, submission }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn submission(&self) -> u64 {
        self.submission
    }
}

// ============================================================================
// Lifecycle contract
// ============================================================================

/// Lifecycle shared by every backend variant.
///
/// Steps are called strictly in order by [`Session`](crate::Session). Any
/// error is fatal to the session. `teardown` must release whatever was
/// created so far, in reverse creation order, and be safe to call on a
/// backend that never got past `acquire`.
pub trait ComputeBackend {
    fn kind(&self) -> BackendKind;

    /// Selects the first compute-capable device and queue and creates the
    /// context with a single compute queue.
    fn acquire(&mut self) -> ComputeResult<DeviceInfo>;

    /// Creates source and destination images and uploads `image`.
    fn allocate(&mut self, device: &DeviceInfo, image: &PixelBuffer) -> ComputeResult<ResourceSet>;

    /// Builds the program against the fixed binding layout.
    fn compile(&mut self, device: &DeviceInfo, kernel: &KernelSource) -> ComputeResult<ProgramInfo>;

    /// Records `plan`, submits it once and blocks until the device signals
    /// completion.
    fn dispatch(&mut self, program: &ProgramInfo, resources: &ResourceSet, plan: &DispatchPlan)
    -> ComputeResult<SyncToken>;

    /// Reads the destination image back as host samples with the buffer's
    /// channel count.
    fn retrieve(&mut self, resources: &ResourceSet, token: SyncToken) -> ComputeResult<Vec<f32>>;

    /// Retrieves the output and checks it against `expected`.
    fn validate(
        &mut self,
        expected: &PixelBuffer,
        resources: &ResourceSet,
        token: SyncToken,
        tolerance: Tolerance,
    ) -> ComputeResult<ValidationReport> {
        let got = self.retrieve(resources, token)?;
        let report =
            validate(expected.data(), &got, tolerance).map_err(|e| ComputeError::Validation(e.to_string()))?;
        if !report.passed() {
            return Err(ComputeError::Validation(report.to_string()));
        }
        Ok(report)
    }

    /// Releases every live handle, newest first. Returns the count.
    fn teardown(&mut self) -> usize;

    /// Handles created and not yet released.
    fn live_handles(&self) -> usize;
}

// ============================================================================
// Tag switch
// ============================================================================

/// Closed set of backend variants.
pub enum AnyBackend {
    #[cfg(feature = "opencl")]
    Stream(StreamBackend),
    #[cfg(feature = "wgpu")]
    RasterCompute(RasterComputeBackend),
    #[cfg(feature = "vulkan")]
    Explicit(ExplicitBackend),
    /// Variant compiled out; every step fails.
    Disabled(BackendKind),
}

/// Creates the backend for `kind`. No driver call happens before `acquire`.
pub fn create_backend(kind: BackendKind, config: &SessionConfig) -> AnyBackend {
    match kind {
        #[cfg(feature = "opencl")]
        BackendKind::Stream => AnyBackend::Stream(StreamBackend::new(config)),
        #[cfg(feature = "wgpu")]
        BackendKind::RasterCompute => AnyBackend::RasterCompute(RasterComputeBackend::new(config)),
        #[cfg(feature = "vulkan")]
        BackendKind::Explicit => AnyBackend::Explicit(ExplicitBackend::new(config)),
        #[allow(unreachable_patterns)]
        other => {
            let _ = config;
            AnyBackend::Disabled(other)
        }
    }
}

impl AnyBackend {
    fn disabled(kind: BackendKind) -> ComputeError {
        ComputeError::ResourceAcquisition(format!(
            "{} backend not available: built without the '{}' feature",
            kind.name(),
            kind.feature()
        ))
    }
}

macro_rules! forward {
    ($self:ident, $b:ident => $call:expr, $kind:ident => $disabled:expr) => {
        match $self {
            #[cfg(feature = "opencl")]
            AnyBackend::Stream($b) => $call,
            #[cfg(feature = "wgpu")]
            AnyBackend::RasterCompute($b) => $call,
            #[cfg(feature = "vulkan")]
            AnyBackend::Explicit($b) => $call,
            AnyBackend::Disabled($kind) => $disabled,
        }
    };
}

impl ComputeBackend for AnyBackend {
    fn kind(&self) -> BackendKind {
        forward!(self, b => b.kind(), kind => *kind)
    }

    fn acquire(&mut self) -> ComputeResult<DeviceInfo> {
        forward!(self, b => b.acquire(), kind => Err(Self::disabled(*kind)))
    }

    fn allocate(&mut self, device: &DeviceInfo, image: &PixelBuffer) -> ComputeResult<ResourceSet> {
        forward!(self, b => b.allocate(device, image), kind => Err(Self::disabled(*kind)))
    }

    fn compile(&mut self, device: &DeviceInfo, kernel: &KernelSource) -> ComputeResult<ProgramInfo> {
        forward!(self, b => b.compile(device, kernel), kind => Err(Self::disabled(*kind)))
    }

    fn dispatch(
        &mut self,
        program: &ProgramInfo,
        resources: &ResourceSet,
        plan: &DispatchPlan,
    ) -> ComputeResult<SyncToken> {
        forward!(self, b => b.dispatch(program, resources, plan), kind => Err(Self::disabled(*kind)))
    }

    fn retrieve(&mut self, resources: &ResourceSet, token: SyncToken) -> ComputeResult<Vec<f32>> {
        forward!(self, b => b.retrieve(resources, token), kind => Err(Self::disabled(*kind)))
    }

    fn teardown(&mut self) -> usize {
        forward!(self, b => b.teardown(), _kind => 0)
    }

    fn live_handles(&self) -> usize {
        forward!(self, b => b.live_handles(), _kind => 0)
    }
}

/// Bytes of one RGBA32F image.
pub(crate) fn rgba_image_bytes(extent: Extent) -> u64 {
    extent.pixel_count() as u64 * kiln_core::RGBA_CHANNELS as u64 * std::mem::size_of::<f32>() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_kind_names() {
        assert_eq!(BackendKind::Explicit.api_name(), "vulkan");
        assert_eq!(BackendKind::Stream.api_name(), "opencl");
        assert_eq!(BackendKind::RasterCompute.name(), "raster");
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("VK".parse::<BackendKind>().unwrap(), BackendKind::Explicit);
        assert_eq!("raster".parse::<BackendKind>().unwrap(), BackendKind::RasterCompute);
        assert_eq!("opencl".parse::<BackendKind>().unwrap(), BackendKind::Stream);
        assert!("metal".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_staging_per_kind() {
        assert_eq!(BackendKind::Explicit.staging(), Staging::FULL);
        assert_eq!(BackendKind::Stream.staging(), Staging::NONE);
        assert!(BackendKind::RasterCompute.staging().readback);
    }

    #[test]
    fn test_disabled_backend_fails_acquire() {
        let mut backend = AnyBackend::Disabled(BackendKind::Stream);
        let err = backend.acquire().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAcquisition);
        assert!(err.to_string().contains("opencl"));
        assert_eq!(backend.teardown(), 0);
        assert_eq!(backend.kind(), BackendKind::Stream);
    }

    #[test]
    fn test_create_backend_kind() {
        let config = SessionConfig::default();
        for kind in BackendKind::ALL {
            let backend = create_backend(kind, &config);
            assert_eq!(backend.kind(), kind);
            assert_eq!(backend.live_handles(), 0);
        }
    }

    #[test]
    fn test_image_bytes() {
        assert_eq!(rgba_image_bytes(Extent::new(8, 8)), 8 * 8 * 16);
    }
}
