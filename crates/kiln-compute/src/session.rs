//! One full lifecycle run for a single backend.
//!
//! ```text
//! Uninitialized -> ContextReady -> ResourcesReady -> PipelineReady
//!               -> Dispatched -> Validated -> TornDown
//!        any step fails -> Failed(step), teardown still runs
//! ```
//!
//! The state is a single [`Stage`] value that carries each step's output
//! into the next step. Teardown runs unconditionally after the last step
//! that was attempted.

use std::fmt;
use std::path::PathBuf;

use kiln_core::{PixelBuffer, Tolerance, ValidationReport};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendKind, ComputeBackend, DeviceInfo, ProgramInfo, ResourceSet, SyncToken, create_backend};
use crate::config::SessionConfig;
use crate::kernel::KernelSource;
use crate::plan::DispatchPlan;
use crate::ComputeError;

/// Lifecycle steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleStep {
    Acquire,
    Allocate,
    Compile,
    Dispatch,
    Validate,
    Teardown,
}

impl fmt::Display for LifecycleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Acquire => "acquire",
            Self::Allocate => "allocate",
            Self::Compile => "compile",
            Self::Dispatch => "dispatch",
            Self::Validate => "validate",
            Self::Teardown => "teardown",
        })
    }
}

/// State label recorded in the session history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    ContextReady,
    ResourcesReady,
    PipelineReady,
    Dispatched,
    Validated,
    TornDown,
    Failed(LifecycleStep),
}

/// Session state with the data the next step consumes.
#[derive(Debug)]
pub enum Stage {
    Uninitialized,
    ContextReady {
        device: DeviceInfo,
    },
    ResourcesReady {
        device: DeviceInfo,
        resources: ResourceSet,
    },
    PipelineReady {
        device: DeviceInfo,
        resources: ResourceSet,
        program: ProgramInfo,
    },
    Dispatched {
        device: DeviceInfo,
        resources: ResourceSet,
        token: SyncToken,
    },
    Validated {
        device: DeviceInfo,
        report: ValidationReport,
    },
}

impl Stage {
    pub fn state(&self) -> SessionState {
        match self {
            Self::Uninitialized => SessionState::Uninitialized,
            Self::ContextReady { .. } => SessionState::ContextReady,
            Self::ResourcesReady { .. } => SessionState::ResourcesReady,
            Self::PipelineReady { .. } => SessionState::PipelineReady,
            Self::Dispatched { .. } => SessionState::Dispatched,
            Self::Validated { .. } => SessionState::Validated,
        }
    }

    /// Step that moves out of this stage.
    fn next_step(&self) -> LifecycleStep {
        match self {
            Self::Uninitialized => LifecycleStep::Acquire,
            Self::ContextReady { .. } => LifecycleStep::Allocate,
            Self::ResourcesReady { .. } => LifecycleStep::Compile,
            Self::PipelineReady { .. } => LifecycleStep::Dispatch,
            Self::Dispatched { .. } => LifecycleStep::Validate,
            Self::Validated { .. } => LifecycleStep::Teardown,
        }
    }
}

/// Fatal session error: which backend, which step, and why.
#[derive(Error, Debug)]
#[error("{} backend failed during {step}: {source}", .backend.api_name())]
pub struct SessionError {
    pub backend: BackendKind,
    pub step: LifecycleStep,
    #[source]
    pub source: ComputeError,
    /// States passed through before the failure, ending with `Failed`.
    pub states: Vec<SessionState>,
    /// Handles released by the teardown that followed.
    pub released: usize,
}

/// Successful session outcome.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub backend: BackendKind,
    pub device: DeviceInfo,
    pub validation: ValidationReport,
    pub states: Vec<SessionState>,
    pub released: usize,
}

impl SessionReport {
    /// Human-readable pass line.
    pub fn pass_line(&self) -> String {
        format!("{} pass! [{}] {}", self.backend.api_name(), self.device.name, self.validation)
    }
}

/// Lifecycle driver over one backend.
pub struct Session<B: ComputeBackend> {
    backend: B,
    image: PixelBuffer,
    kernel_dir: PathBuf,
    tolerance: Tolerance,
    history: Vec<SessionState>,
}

impl<B: ComputeBackend> Session<B> {
    pub fn new(backend: B, image: PixelBuffer, config: &SessionConfig) -> Self {
        Self {
            backend,
            image,
            kernel_dir: config.kernel_dir.clone(),
            tolerance: config.tolerance(),
            history: Vec::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// States of the last run.
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    /// Runs every step once, then tears down. Teardown happens on both the
    /// success and the failure path.
    pub fn run(&mut self) -> Result<SessionReport, SessionError> {
        let kind = self.backend.kind();
        self.history.clear();

        let mut stage = Stage::Uninitialized;
        self.history.push(stage.state());

        let outcome = loop {
            let step = stage.next_step();
            debug!(backend = %kind, %step, "step");
            match self.advance(stage) {
                Ok(Stage::Validated { device, report }) => {
                    self.history.push(SessionState::Validated);
                    break Ok((device, report));
                }
                Ok(next) => {
                    self.history.push(next.state());
                    stage = next;
                }
                Err(err) => {
                    self.history.push(SessionState::Failed(step));
                    break Err((step, err));
                }
            }
        };

        let released = self.backend.teardown();
        let leaked = self.backend.live_handles();
        if leaked > 0 {
            warn!(backend = %kind, leaked, "handles still live after teardown");
        }
        debug!(backend = %kind, released, "teardown");

        match outcome {
            Ok((device, report)) => {
                self.history.push(SessionState::TornDown);
                info!(backend = %kind, device = %device.name, %report, "session passed");
                Ok(SessionReport {
                    backend: kind,
                    device,
                    validation: report,
                    states: self.history.clone(),
                    released,
                })
            }
            Err((step, source)) => {
                error!(backend = %kind, %step, error = %source, "session failed");
                Err(SessionError {
                    backend: kind,
                    step,
                    source,
                    states: self.history.clone(),
                    released,
                })
            }
        }
    }

    fn advance(&mut self, stage: Stage) -> Result<Stage, ComputeError> {
        Ok(match stage {
            Stage::Uninitialized => {
                let device = self.backend.acquire()?;
                info!(backend = %device.kind, device = %device.name, platform = %device.platform, "device selected");
                Stage::ContextReady { device }
            }
            Stage::ContextReady { device } => {
                let resources = self.backend.allocate(&device, &self.image)?;
                debug!(extent = %resources.extent, bytes = resources.image_bytes, "images allocated");
                Stage::ResourcesReady { device, resources }
            }
            Stage::ResourcesReady { device, resources } => {
                let kernel = KernelSource::load(self.backend.kind(), &self.kernel_dir)?;
                let program = self.backend.compile(&device, &kernel)?;
                Stage::PipelineReady {
                    device,
                    resources,
                    program,
                }
            }
            Stage::PipelineReady {
                device,
                resources,
                program,
            } => {
                let plan = DispatchPlan::new(resources.extent, resources.staging);
                let token = self.backend.dispatch(&program, &resources, &plan)?;
                Stage::Dispatched {
                    device,
                    resources,
                    token,
                }
            }
            Stage::Dispatched {
                device,
                resources,
                token,
            } => {
                let report = self.backend.validate(&self.image, &resources, token, self.tolerance)?;
                Stage::Validated { device, report }
            }
            validated @ Stage::Validated { .. } => validated,
        })
    }
}

/// Builds a fresh reference image and runs one isolated session of `kind`.
///
/// Invalid dimensions are reported as an allocation failure before any
/// device is touched.
pub fn run_backend(kind: BackendKind, config: &SessionConfig) -> Result<SessionReport, SessionError> {
    let image = PixelBuffer::generate(config.width, config.height, config.channels, &config.generator).map_err(
        |e| SessionError {
            backend: kind,
            step: LifecycleStep::Allocate,
            source: ComputeError::MemoryAllocation(e.to_string()),
            states: vec![SessionState::Uninitialized, SessionState::Failed(LifecycleStep::Allocate)],
            released: 0,
        },
    )?;
    let backend = create_backend(kind, config);
    Session::new(backend, image, config).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_step_display() {
        assert_eq!(LifecycleStep::Allocate.to_string(), "allocate");
    }

    #[test]
    fn test_stage_order() {
        let stage = Stage::Uninitialized;
        assert_eq!(stage.state(), SessionState::Uninitialized);
        assert_eq!(stage.next_step(), LifecycleStep::Acquire);
    }

    #[test]
    fn test_run_backend_invalid_dimensions() {
        let config = SessionConfig::default().with_dimensions(0, 8, 4);
        let err = run_backend(BackendKind::Explicit, &config).unwrap_err();
        assert_eq!(err.step, LifecycleStep::Allocate);
        assert_eq!(err.source.kind(), ErrorKind::MemoryAllocation);
        assert_eq!(err.released, 0);
    }
}
