//! Lifecycle tests for the session driver, run against an in-memory backend.

use std::cell::RefCell;
use std::rc::Rc;

use kiln_compute::{
    BackendKind, Command, CommandRecorder, ComputeBackend, ComputeError, ComputeResult, DeviceInfo, DispatchPlan,
    ErrorKind, HandleLedger, KernelSource, LifecycleStep, ProgramInfo, ResourceSet, Session, SessionConfig,
    SessionState, Staging, SyncToken,
};
use kiln_core::{PixelBuffer, expand_to_rgba};

// ============================================================================
// In-memory backend
// ============================================================================

/// Backend that copies host data through and records every handle it makes.
struct MockBackend {
    fail_at: Option<LifecycleStep>,
    corrupt_output: bool,
    staging: Staging,
    ledger: HandleLedger<&'static str>,
    created: Rc<RefCell<Vec<&'static str>>>,
    released: Rc<RefCell<Vec<&'static str>>>,
    recorded: Rc<RefCell<Vec<Command>>>,
    data: Vec<f32>,
    submissions: u64,
    pending: Option<u64>,
}

impl MockBackend {
    fn new() -> Self {
        Self {
            fail_at: None,
            corrupt_output: false,
            staging: Staging::FULL,
            ledger: HandleLedger::new(),
            created: Rc::default(),
            released: Rc::default(),
            recorded: Rc::default(),
            data: Vec::new(),
            submissions: 0,
            pending: None,
        }
    }

    fn failing_at(step: LifecycleStep) -> Self {
        Self {
            fail_at: Some(step),
            ..Self::new()
        }
    }

    fn create(&mut self, handle: &'static str) {
        self.ledger.track(handle);
        self.created.borrow_mut().push(handle);
    }

    fn check(&self, step: LifecycleStep, err: fn(String) -> ComputeError) -> ComputeResult<()> {
        if self.fail_at == Some(step) {
            return Err(err(format!("injected {step} failure")));
        }
        Ok(())
    }
}

struct Collect(Rc<RefCell<Vec<Command>>>);

impl CommandRecorder for Collect {
    fn record(&mut self, command: Command) -> ComputeResult<()> {
        self.0.borrow_mut().push(command);
        Ok(())
    }
}

impl ComputeBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Explicit
    }

    fn acquire(&mut self) -> ComputeResult<DeviceInfo> {
        self.create("instance");
        self.check(LifecycleStep::Acquire, ComputeError::ResourceAcquisition)?;
        self.create("device");
        Ok(DeviceInfo {
            kind: BackendKind::Explicit,
            name: "mock".into(),
            platform: "host".into(),
            queue_family: Some(0),
        })
    }

    fn allocate(&mut self, _device: &DeviceInfo, image: &PixelBuffer) -> ComputeResult<ResourceSet> {
        expand_to_rgba(image.data(), image.channels()).map_err(|e| ComputeError::MemoryAllocation(e.to_string()))?;
        self.create("src");
        self.check(LifecycleStep::Allocate, ComputeError::MemoryAllocation)?;
        self.create("dst");
        self.data = image.data().to_vec();
        Ok(ResourceSet {
            extent: image.extent(),
            channels: image.channels(),
            staging: self.staging,
            image_bytes: image.extent().pixel_count() as u64 * 16,
        })
    }

    fn compile(&mut self, _device: &DeviceInfo, kernel: &KernelSource) -> ComputeResult<ProgramInfo> {
        self.check(LifecycleStep::Compile, ComputeError::CompileOrLink)?;
        self.create("pipeline");
        Ok(ProgramInfo {
            entry_point: "main".into(),
            source: kernel.path().to_path_buf(),
            bindings: 2,
        })
    }

    fn dispatch(
        &mut self,
        _program: &ProgramInfo,
        _resources: &ResourceSet,
        plan: &DispatchPlan,
    ) -> ComputeResult<SyncToken> {
        self.create("command_pool");
        plan.record(&mut Collect(Rc::clone(&self.recorded)))?;
        self.create("fence");
        self.check(LifecycleStep::Dispatch, ComputeError::Synchronization)?;
        self.submissions += 1;
        self.pending = Some(self.submissions);
        Ok(SyncToken::new(BackendKind::Explicit, self.submissions))
    }

    fn retrieve(&mut self, _resources: &ResourceSet, token: SyncToken) -> ComputeResult<Vec<f32>> {
        if self.pending != Some(token.submission()) {
            return Err(ComputeError::Synchronization("stale token".into()));
        }
        self.pending = None;
        let mut out = self.data.clone();
        if self.corrupt_output || self.fail_at == Some(LifecycleStep::Validate) {
            if let Some(first) = out.first_mut() {
                *first += 1.0;
            }
        }
        Ok(out)
    }

    fn teardown(&mut self) -> usize {
        let released = Rc::clone(&self.released);
        self.ledger.release_all(|h| released.borrow_mut().push(h))
    }

    fn live_handles(&self) -> usize {
        self.ledger.outstanding()
    }
}

fn image(width: u32, height: u32, channels: u32) -> PixelBuffer {
    PixelBuffer::generate(width, height, channels, &SessionConfig::default().generator).unwrap()
}

fn reversed(v: &[&'static str]) -> Vec<&'static str> {
    v.iter().rev().copied().collect()
}

const STEPS: [LifecycleStep; 5] = [
    LifecycleStep::Acquire,
    LifecycleStep::Allocate,
    LifecycleStep::Compile,
    LifecycleStep::Dispatch,
    LifecycleStep::Validate,
];

// ============================================================================
// Success path
// ============================================================================

#[test]
fn test_session_passes() {
    let config = SessionConfig::default();
    let backend = MockBackend::new();
    let created = Rc::clone(&backend.created);
    let released = Rc::clone(&backend.released);

    let mut session = Session::new(backend, image(8, 8, 4), &config);
    let report = session.run().unwrap();

    assert_eq!(
        report.states,
        vec![
            SessionState::Uninitialized,
            SessionState::ContextReady,
            SessionState::ResourcesReady,
            SessionState::PipelineReady,
            SessionState::Dispatched,
            SessionState::Validated,
            SessionState::TornDown,
        ]
    );
    assert_eq!(session.history(), report.states.as_slice());
    assert!(report.validation.passed());
    assert_eq!(report.validation.len, 8 * 8 * 4);
    assert_eq!(report.released, 7);
    assert_eq!(session.backend().live_handles(), 0);
    assert_eq!(*released.borrow(), reversed(&created.borrow()));
    assert!(report.pass_line().starts_with("vulkan pass! [mock]"));
}

#[test]
fn test_single_pixel_single_channel() {
    let config = SessionConfig::default().with_dimensions(1, 1, 1);
    let mut session = Session::new(MockBackend::new(), image(1, 1, 1), &config);
    let report = session.run().unwrap();
    assert_eq!(report.validation.len, 1);
    assert_eq!(report.backend, BackendKind::Explicit);
}

#[test]
fn test_plan_is_recorded_in_order() {
    let config = SessionConfig::default().with_dimensions(3, 2, 4);
    let backend = MockBackend::new();
    let recorded = Rc::clone(&backend.recorded);
    Session::new(backend, image(3, 2, 4), &config).run().unwrap();
    assert_eq!(
        *recorded.borrow(),
        vec![
            Command::UploadCopy,
            Command::PreComputeBarrier,
            Command::BindProgram,
            Command::Dispatch { x: 3, y: 2, z: 1 },
            Command::PostComputeBarrier,
            Command::ReadbackCopy,
        ]
    );
}

#[test]
fn test_plan_follows_allocated_staging() {
    let config = SessionConfig::default().with_dimensions(2, 2, 4);
    let backend = MockBackend {
        staging: Staging::READBACK_ONLY,
        ..MockBackend::new()
    };
    let recorded = Rc::clone(&backend.recorded);
    Session::new(backend, image(2, 2, 4), &config).run().unwrap();
    assert_eq!(
        *recorded.borrow(),
        vec![
            Command::PreComputeBarrier,
            Command::BindProgram,
            Command::Dispatch { x: 2, y: 2, z: 1 },
            Command::PostComputeBarrier,
            Command::ReadbackCopy,
        ]
    );
}

// ============================================================================
// Failure paths
// ============================================================================

#[test]
fn test_failure_at_each_step_still_tears_down() {
    let config = SessionConfig::default();
    for (i, step) in STEPS.into_iter().enumerate() {
        let backend = MockBackend::failing_at(step);
        let created = Rc::clone(&backend.created);
        let released = Rc::clone(&backend.released);

        let mut session = Session::new(backend, image(4, 4, 4), &config);
        let err = session.run().unwrap_err();

        assert_eq!(err.step, step, "step {step}");
        assert_eq!(err.backend, BackendKind::Explicit);
        // Uninitialized plus one state per completed step, then Failed.
        assert_eq!(err.states.len(), i + 2, "step {step}: {:?}", err.states);
        assert_eq!(err.states.last(), Some(&SessionState::Failed(step)));
        assert!(!err.states.contains(&SessionState::TornDown));
        assert!(!err.states.contains(&SessionState::Validated));

        assert_eq!(session.backend().live_handles(), 0, "step {step}");
        assert_eq!(err.released, created.borrow().len(), "step {step}");
        assert_eq!(*released.borrow(), reversed(&created.borrow()), "step {step}");
    }
}

#[test]
fn test_failure_kinds_per_step() {
    let config = SessionConfig::default();
    let expected = [
        ErrorKind::ResourceAcquisition,
        ErrorKind::MemoryAllocation,
        ErrorKind::CompileOrLink,
        ErrorKind::Synchronization,
        ErrorKind::Validation,
    ];
    for (step, kind) in STEPS.into_iter().zip(expected) {
        let err = Session::new(MockBackend::failing_at(step), image(2, 2, 4), &config)
            .run()
            .unwrap_err();
        assert_eq!(err.source.kind(), kind, "step {step}");
        assert!(err.to_string().contains(&step.to_string()));
    }
}

#[test]
fn test_acquire_failure_skips_later_steps() {
    let config = SessionConfig::default();
    let backend = MockBackend::failing_at(LifecycleStep::Acquire);
    let created = Rc::clone(&backend.created);
    let recorded = Rc::clone(&backend.recorded);

    let err = Session::new(backend, image(2, 2, 4), &config).run().unwrap_err();
    assert_eq!(err.states, vec![SessionState::Uninitialized, SessionState::Failed(LifecycleStep::Acquire)]);
    assert_eq!(*created.borrow(), vec!["instance"]);
    assert!(recorded.borrow().is_empty());
    assert_eq!(err.released, 1);
}

#[test]
fn test_unsupported_channels_fail_allocation() {
    let config = SessionConfig::default().with_dimensions(2, 2, 5);
    let err = Session::new(MockBackend::new(), image(2, 2, 5), &config)
        .run()
        .unwrap_err();
    assert_eq!(err.step, LifecycleStep::Allocate);
    assert_eq!(err.source.kind(), ErrorKind::MemoryAllocation);
}

#[test]
fn test_missing_kernel_fails_compile() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig::default().with_kernel_dir(dir.path());
    let backend = MockBackend::new();
    let created = Rc::clone(&backend.created);

    let err = Session::new(backend, image(2, 2, 4), &config).run().unwrap_err();
    assert_eq!(err.step, LifecycleStep::Compile);
    assert_eq!(err.source.kind(), ErrorKind::CompileOrLink);
    assert!(!created.borrow().contains(&"pipeline"));
    assert_eq!(err.released, 4);
}

#[test]
fn test_wrong_output_reports_validation() {
    let config = SessionConfig::default();
    let mut backend = MockBackend::new();
    backend.corrupt_output = true;
    let err = Session::new(backend, image(4, 4, 4), &config).run().unwrap_err();
    assert_eq!(err.step, LifecycleStep::Validate);
    assert!(err.source.to_string().contains("first at [0]"));
}

#[test]
fn test_tolerance_override_accepts_small_error() {
    let config = SessionConfig::default().with_tolerance(2.0);
    let mut backend = MockBackend::new();
    backend.corrupt_output = true;
    let report = Session::new(backend, image(4, 4, 4), &config).run().unwrap();
    assert!(report.validation.passed());
    assert!(report.validation.max_diff > 0.5);
}

// ============================================================================
// Sync token
// ============================================================================

#[test]
fn test_token_consumed_once() {
    let mut backend = MockBackend::new();
    let device = backend.acquire().unwrap();
    let buffer = image(2, 2, 4);
    let resources = backend.allocate(&device, &buffer).unwrap();
    let kernel = KernelSource::load(BackendKind::Explicit, &SessionConfig::default().kernel_dir).unwrap();
    let program = backend.compile(&device, &kernel).unwrap();
    let plan = DispatchPlan::new(resources.extent, Staging::FULL);

    let token = backend.dispatch(&program, &resources, &plan).unwrap();
    let submission = token.submission();
    assert_eq!(backend.retrieve(&resources, token).unwrap(), buffer.data());

    let replay = SyncToken::new(BackendKind::Explicit, submission);
    let err = backend.retrieve(&resources, replay).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Synchronization);

    assert_eq!(backend.teardown(), 7);
    assert_eq!(backend.teardown(), 0);
}
