//! Ordered command sequence for one dispatch.
//!
//! The plan is built before anything is recorded, so the ordering
//! (upload, barrier, bind, dispatch, barrier, readback) is fixed in one place
//! and every backend records it by walking [`DispatchPlan::commands`] through
//! its own [`CommandRecorder`].

use kiln_core::Extent;

use crate::ComputeResult;

/// One step of the dispatch sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Staging source -> device-resident source.
    UploadCopy,
    /// Source readable by the shader, destination writable.
    PreComputeBarrier,
    /// Bind program and both image bindings.
    BindProgram,
    /// One invocation per pixel.
    Dispatch { x: u32, y: u32, z: u32 },
    /// Destination writes visible to the following copy/read.
    PostComputeBarrier,
    /// Device-resident destination -> staging destination.
    ReadbackCopy,
}

/// Which staging hops a backend needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Staging {
    pub upload: bool,
    pub readback: bool,
}

impl Staging {
    /// Host memory is addressed directly both ways.
    pub const NONE: Self = Self {
        upload: false,
        readback: false,
    };
    /// Device-local images with host-visible mirrors on both sides.
    pub const FULL: Self = Self {
        upload: true,
        readback: true,
    };
    /// Direct upload, copy-out for readback.
    pub const READBACK_ONLY: Self = Self {
        upload: false,
        readback: true,
    };
}

/// Backend-specific sink for plan commands.
pub trait CommandRecorder {
    fn record(&mut self, command: Command) -> ComputeResult<()>;
}

/// Command sequence for a single (width, height, 1) dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPlan {
    extent: Extent,
    staging: Staging,
    commands: Vec<Command>,
}

impl DispatchPlan {
    pub fn new(extent: Extent, staging: Staging) -> Self {
        let mut commands = Vec::with_capacity(6);
        if staging.upload {
            commands.push(Command::UploadCopy);
        }
        commands.push(Command::PreComputeBarrier);
        commands.push(Command::BindProgram);
        commands.push(Command::Dispatch {
            x: extent.width,
            y: extent.height,
            z: 1,
        });
        commands.push(Command::PostComputeBarrier);
        if staging.readback {
            commands.push(Command::ReadbackCopy);
        }
        Self {
            extent,
            staging,
            commands,
        }
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn staging(&self) -> Staging {
        self.staging
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Dispatch grid: exactly one invocation per pixel, no tiling.
    pub fn grid(&self) -> (u32, u32, u32) {
        (self.extent.width, self.extent.height, 1)
    }

    /// Feeds every command to `recorder`, stopping at the first error.
    pub fn record<R: CommandRecorder + ?Sized>(&self, recorder: &mut R) -> ComputeResult<()> {
        self.commands.iter().try_for_each(|&c| recorder.record(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ComputeError;

    #[derive(Default)]
    struct Collect(Vec<Command>);

    impl CommandRecorder for Collect {
        fn record(&mut self, command: Command) -> ComputeResult<()> {
            self.0.push(command);
            Ok(())
        }
    }

    fn position(plan: &DispatchPlan, cmd: Command) -> Option<usize> {
        plan.commands().iter().position(|c| *c == cmd)
    }

    #[test]
    fn test_full_staging_order() {
        let plan = DispatchPlan::new(Extent::new(8, 8), Staging::FULL);
        assert_eq!(
            plan.commands(),
            &[
                Command::UploadCopy,
                Command::PreComputeBarrier,
                Command::BindProgram,
                Command::Dispatch { x: 8, y: 8, z: 1 },
                Command::PostComputeBarrier,
                Command::ReadbackCopy,
            ]
        );
    }

    #[test]
    fn test_readback_after_post_barrier() {
        for staging in [Staging::FULL, Staging::READBACK_ONLY] {
            let plan = DispatchPlan::new(Extent::new(3, 5), staging);
            let barrier = position(&plan, Command::PostComputeBarrier).unwrap();
            let readback = position(&plan, Command::ReadbackCopy).unwrap();
            assert!(readback > barrier);
        }
    }

    #[test]
    fn test_no_staging_has_no_copies() {
        let plan = DispatchPlan::new(Extent::new(2, 2), Staging::NONE);
        assert_eq!(position(&plan, Command::UploadCopy), None);
        assert_eq!(position(&plan, Command::ReadbackCopy), None);
        assert_eq!(plan.commands().len(), 4);
    }

    #[test]
    fn test_grid_is_one_per_pixel() {
        let plan = DispatchPlan::new(Extent::new(17, 3), Staging::NONE);
        assert_eq!(plan.grid(), (17, 3, 1));
        assert!(plan.commands().contains(&Command::Dispatch { x: 17, y: 3, z: 1 }));

        let single = DispatchPlan::new(Extent::new(1, 1), Staging::FULL);
        assert_eq!(single.grid(), (1, 1, 1));
    }

    #[test]
    fn test_record_walks_in_order() {
        let plan = DispatchPlan::new(Extent::new(4, 4), Staging::FULL);
        let mut rec = Collect::default();
        plan.record(&mut rec).unwrap();
        assert_eq!(rec.0, plan.commands());
    }

    #[test]
    fn test_record_stops_on_error() {
        struct FailOnDispatch(usize);
        impl CommandRecorder for FailOnDispatch {
            fn record(&mut self, command: Command) -> ComputeResult<()> {
                if matches!(command, Command::Dispatch { .. }) {
                    return Err(ComputeError::Synchronization("boom".into()));
                }
                self.0 += 1;
                Ok(())
            }
        }

        let plan = DispatchPlan::new(Extent::new(4, 4), Staging::FULL);
        let mut rec = FailOnDispatch(0);
        assert!(plan.record(&mut rec).is_err());
        assert_eq!(rec.0, 3);
    }
}
