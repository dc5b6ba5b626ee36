//! GPU compute-dispatch lifecycle.
//!
//! Runs one image kernel on a device and checks the result against the host
//! reference. Three backend variants share the same lifecycle:
//!
//! ```text
//! Session (acquire -> allocate -> compile -> dispatch -> validate -> teardown)
//!     └── AnyBackend
//!             ├── StreamBackend        (OpenCL, implicit memory)
//!             ├── RasterComputeBackend (wgpu, implicit memory)
//!             └── ExplicitBackend      (Vulkan, staging + barriers + fence)
//! ```
//!
//! Every backend records its handles in a [`HandleLedger`] and releases them
//! in reverse creation order, whether the session passed or failed.
//!
//! # Example
//!
//! ```ignore
//! use kiln_compute::{BackendKind, SessionConfig, run_backend};
//!
//! let config = SessionConfig::from_env();
//! let report = run_backend(BackendKind::Explicit, &config)?;
//! println!("{}", report.pass_line());
//! ```

pub mod backend;
pub mod config;
pub mod kernel;
pub mod ledger;
pub mod plan;
pub mod session;

pub use backend::{
    AnyBackend, BackendInfo, BackendKind, ComputeBackend, DeviceInfo, ProgramInfo, ResourceSet, SyncToken,
    create_backend, describe_backends, detect_backends,
};
pub use config::SessionConfig;
pub use kernel::{BINDING_LAYOUT, Binding, BindingAccess, KernelSource};
pub use ledger::HandleLedger;
pub use plan::{Command, CommandRecorder, DispatchPlan, Staging};
pub use session::{LifecycleStep, Session, SessionError, SessionReport, SessionState, Stage, run_backend};

use thiserror::Error;

/// Lifecycle failures. Every one is fatal to the session that raised it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComputeError {
    /// No compute-capable device or queue, driver missing, or context
    /// creation rejected.
    #[error("resource acquisition failed: {0}")]
    ResourceAcquisition(String),

    /// Kernel missing, rejected by the compiler, or failed to link.
    #[error("compile/link failed: {0}")]
    CompileOrLink(String),

    /// No memory type satisfies the request, or the allocation was rejected.
    #[error("memory allocation failed: {0}")]
    MemoryAllocation(String),

    /// Fence/event creation, submission or wait failed, including timeout.
    #[error("synchronization failed: {0}")]
    Synchronization(String),

    /// Retrieved output differs from the reference beyond tolerance.
    #[error("validation failed: {0}")]
    Validation(String),
}

/// Discriminant of [`ComputeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ResourceAcquisition,
    CompileOrLink,
    MemoryAllocation,
    Synchronization,
    Validation,
}

impl ComputeError {
    /// Error kind without the message.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ResourceAcquisition(_) => ErrorKind::ResourceAcquisition,
            Self::CompileOrLink(_) => ErrorKind::CompileOrLink,
            Self::MemoryAllocation(_) => ErrorKind::MemoryAllocation,
            Self::Synchronization(_) => ErrorKind::Synchronization,
            Self::Validation(_) => ErrorKind::Validation,
        }
    }
}

pub type ComputeResult<T> = Result<T, ComputeError>;
