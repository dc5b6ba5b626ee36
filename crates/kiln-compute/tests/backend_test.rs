//! Backend tests for kiln-compute.
//!
//! These run on whatever the machine has. A variant without a device must
//! fail with a typed error and still release everything it created.

use kiln_compute::{
    BackendKind, ComputeBackend, ErrorKind, LifecycleStep, Session, SessionConfig, SessionState, create_backend,
    describe_backends, detect_backends, run_backend,
};
use kiln_core::PixelBuffer;

#[test]
fn test_describe_backends() {
    let desc = describe_backends();
    println!("{}", desc);
    for kind in BackendKind::ALL {
        assert!(desc.contains(kind.api_name()), "{kind} missing from:\n{desc}");
    }
}

#[test]
fn test_detect_matches_features() {
    for info in detect_backends() {
        assert_eq!(info.enabled, info.kind.is_enabled());
        if info.available {
            assert!(info.enabled);
        }
    }
}

#[test]
fn test_every_backend_passes_or_fails_typed() {
    let config = SessionConfig::default();
    for kind in BackendKind::ALL {
        let image = PixelBuffer::generate(config.width, config.height, config.channels, &config.generator).unwrap();
        let mut session = Session::new(create_backend(kind, &config), image, &config);
        match session.run() {
            Ok(report) => {
                println!("{}", report.pass_line());
                assert!(report.validation.passed());
                assert_eq!(report.states.last(), Some(&SessionState::TornDown));
            }
            Err(err) => {
                println!("{err}");
                assert!(matches!(err.states.last(), Some(SessionState::Failed(_))));
                if !kind.is_enabled() {
                    assert_eq!(err.step, LifecycleStep::Acquire);
                    assert_eq!(err.source.kind(), ErrorKind::ResourceAcquisition);
                }
            }
        }
        assert_eq!(session.backend().live_handles(), 0, "{kind} leaked handles");
    }
}

#[test]
fn test_odd_extent_single_channel() {
    let config = SessionConfig::default().with_dimensions(5, 3, 1).with_seed(7);
    for kind in BackendKind::ALL {
        match run_backend(kind, &config) {
            Ok(report) => assert_eq!(report.validation.len, 15),
            Err(err) => println!("{err}"),
        }
    }
}

#[test]
fn test_zero_width_fails_before_device() {
    let config = SessionConfig::default().with_dimensions(0, 4, 4);
    for kind in BackendKind::ALL {
        let err = run_backend(kind, &config).unwrap_err();
        assert_eq!(err.step, LifecycleStep::Allocate);
        assert_eq!(err.source.kind(), ErrorKind::MemoryAllocation);
        assert_eq!(err.released, 0);
    }
}

#[test]
fn test_five_channels_rejected() {
    let config = SessionConfig::default().with_dimensions(2, 2, 5);
    for kind in BackendKind::ALL {
        let err = run_backend(kind, &config).unwrap_err();
        // Without a device the failure happens earlier, at acquire.
        if err.step != LifecycleStep::Acquire {
            assert_eq!(err.step, LifecycleStep::Allocate);
            assert_eq!(err.source.kind(), ErrorKind::MemoryAllocation);
        }
    }
}
