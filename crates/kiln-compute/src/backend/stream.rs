//! Stream backend on OpenCL (opencl3).
//!
//! Memory is implicit: the source image copies the host buffer at creation
//! (`CL_MEM_COPY_HOST_PTR`) and the result is read with a blocking image read.
//! There is no staging hop and no explicit layout state.
//!
//! OpenCL has no timed event wait, so dispatch polls the kernel event's
//! execution status until it reports `CL_COMPLETE` or the fence timeout runs
//! out. After a timeout, teardown skips `clFinish` and releases objects
//! straight away; the runtime keeps them alive until queued work retires.

use std::ptr;
use std::time::{Duration, Instant};

use kiln_core::{Extent, PixelBuffer, RGBA_CHANNELS, collapse_from_rgba, expand_to_rgba};
use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{CL_DEVICE_TYPE_GPU, Device};
use opencl3::event::{CL_COMPLETE, Event};
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{
    CL_FLOAT, CL_MEM_COPY_HOST_PTR, CL_MEM_OBJECT_IMAGE2D, CL_MEM_READ_ONLY, CL_MEM_WRITE_ONLY, CL_RGBA, Image,
};
use opencl3::platform::get_platforms;
use opencl3::program::Program;
use opencl3::types::{CL_BLOCKING, cl_image_desc, cl_image_format, cl_int};
use tracing::{debug, info, trace, warn};

use super::{BackendKind, ComputeBackend, DeviceInfo, ProgramInfo, ResourceSet, SyncToken, rgba_image_bytes};
use crate::config::SessionConfig;
use crate::kernel::{self, BINDING_LAYOUT, KernelSource};
use crate::ledger::HandleLedger;
use crate::plan::{Command, CommandRecorder, DispatchPlan, Staging};
use crate::{ComputeError, ComputeResult};

const IMAGE_FORMAT: cl_image_format = cl_image_format {
    image_channel_order: CL_RGBA,
    image_channel_data_type: CL_FLOAT,
};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Reads a `CL_EVENT_COMMAND_EXECUTION_STATUS` value. `true` once the
/// command completed; negative values are the error a failed command reports.
fn completion_state(status: cl_int) -> ComputeResult<bool> {
    match status {
        s if s == CL_COMPLETE => Ok(true),
        s if s < 0 => Err(ComputeError::Synchronization(format!("kernel event failed with status {s}"))),
        _ => Ok(false),
    }
}

/// Objects owned by the backend, in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamHandle {
    Context,
    Queue,
    SourceImage,
    DestImage,
    Program,
    Kernel,
}

/// First GPU device with image support, platforms in enumeration order.
fn select_device() -> ComputeResult<(Device, String)> {
    let platforms = get_platforms()
        .map_err(|e| ComputeError::ResourceAcquisition(format!("clGetPlatformIDs failed: {e}")))?;
    for platform in platforms {
        let platform_name = platform.name().unwrap_or_default();
        let ids = platform.get_devices(CL_DEVICE_TYPE_GPU).unwrap_or_default();
        for id in ids {
            let device = Device::new(id);
            if device.image_support().unwrap_or(false) {
                return Ok((device, platform_name.trim().to_string()));
            }
            debug!(platform = %platform_name, "device without image support skipped");
        }
    }
    Err(ComputeError::ResourceAcquisition("no capable device found".into()))
}

fn image_desc(extent: Extent) -> cl_image_desc {
    cl_image_desc {
        image_type: CL_MEM_OBJECT_IMAGE2D,
        image_width: extent.width as usize,
        image_height: extent.height as usize,
        image_depth: 0,
        image_array_size: 0,
        image_row_pitch: 0,
        image_slice_pitch: 0,
        num_mip_levels: 0,
        num_samples: 0,
        buffer: ptr::null_mut(),
    }
}

/// OpenCL lifecycle state.
pub struct StreamBackend {
    timeout: Duration,
    device: Option<Device>,
    context: Option<Context>,
    queue: Option<CommandQueue>,
    src: Option<Image>,
    dst: Option<Image>,
    program: Option<Program>,
    kernel: Option<Kernel>,
    extent: Option<Extent>,
    submissions: u64,
    pending: Option<u64>,
    timed_out: bool,
    ledger: HandleLedger<StreamHandle>,
}

impl StreamBackend {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            timeout: config.fence_timeout,
            device: None,
            context: None,
            queue: None,
            src: None,
            dst: None,
            program: None,
            kernel: None,
            extent: None,
            submissions: 0,
            pending: None,
            timed_out: false,
            ledger: HandleLedger::new(),
        }
    }

    pub fn is_available() -> bool {
        select_device().is_ok()
    }

    /// Polls the kernel event until it completes or the timeout runs out.
    fn wait(&mut self, event: &Event) -> ComputeResult<Duration> {
        let start = Instant::now();
        loop {
            let status = event
                .command_execution_status()
                .map_err(|e| ComputeError::Synchronization(format!("clGetEventInfo failed: {e}")))?;
            if completion_state(status.0)? {
                return Ok(start.elapsed());
            }
            if start.elapsed() >= self.timeout {
                self.timed_out = true;
                return Err(ComputeError::Synchronization(format!(
                    "kernel event not complete within {:?}",
                    self.timeout
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn release(&mut self, handle: StreamHandle) {
        trace!(?handle, "release");
        match handle {
            StreamHandle::Context => {
                drop(self.context.take());
                self.device = None;
            }
            StreamHandle::Queue => drop(self.queue.take()),
            StreamHandle::SourceImage => drop(self.src.take()),
            StreamHandle::DestImage => drop(self.dst.take()),
            StreamHandle::Program => drop(self.program.take()),
            StreamHandle::Kernel => drop(self.kernel.take()),
        }
    }
}

impl ComputeBackend for StreamBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Stream
    }

    fn acquire(&mut self) -> ComputeResult<DeviceInfo> {
        let (device, platform) = select_device()?;
        let name = device.name().unwrap_or_default().trim().to_string();

        let context = Context::from_device(&device)
            .map_err(|e| ComputeError::ResourceAcquisition(format!("clCreateContext failed: {e}")))?;
        let context = self.context.insert(context);
        self.ledger.track(StreamHandle::Context);

        #[allow(deprecated)]
        let queue = CommandQueue::create_default(context, 0)
            .map_err(|e| ComputeError::ResourceAcquisition(format!("clCreateCommandQueue failed: {e}")))?;
        self.queue = Some(queue);
        self.ledger.track(StreamHandle::Queue);
        self.device = Some(device);

        Ok(DeviceInfo {
            kind: BackendKind::Stream,
            name,
            platform,
            queue_family: None,
        })
    }

    fn allocate(&mut self, _device: &DeviceInfo, image: &PixelBuffer) -> ComputeResult<ResourceSet> {
        let extent = image.extent();
        if let Some(device) = &self.device {
            let max_w = device.max_image2d_width().unwrap_or(usize::MAX);
            let max_h = device.max_image2d_height().unwrap_or(usize::MAX);
            if extent.width as usize > max_w || extent.height as usize > max_h {
                return Err(ComputeError::MemoryAllocation(format!(
                    "{extent} exceeds the device limit of {max_w}x{max_h}"
                )));
            }
        }
        let mut rgba =
            expand_to_rgba(image.data(), image.channels()).map_err(|e| ComputeError::MemoryAllocation(e.to_string()))?;
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| ComputeError::ResourceAcquisition("no OpenCL context; acquire has not run".into()))?;

        let desc = image_desc(extent);
        let src = unsafe {
            // SAFETY: rgba holds width * height RGBA32F texels and is copied
            // before create returns.
            Image::create(
                context,
                CL_MEM_READ_ONLY | CL_MEM_COPY_HOST_PTR,
                &IMAGE_FORMAT,
                &desc,
                rgba.as_mut_ptr().cast(),
            )
        }
        .map_err(|e| ComputeError::MemoryAllocation(format!("clCreateImage (source) failed: {e}")))?;
        self.src = Some(src);
        self.ledger.track(StreamHandle::SourceImage);

        let dst = unsafe {
            // SAFETY: no host pointer.
            Image::create(context, CL_MEM_WRITE_ONLY, &IMAGE_FORMAT, &desc, ptr::null_mut())
        }
        .map_err(|e| ComputeError::MemoryAllocation(format!("clCreateImage (destination) failed: {e}")))?;
        self.dst = Some(dst);
        self.ledger.track(StreamHandle::DestImage);
        self.extent = Some(extent);
        debug!(%extent, channels = image.channels(), "images allocated");

        Ok(ResourceSet {
            extent,
            channels: image.channels(),
            staging: Staging::NONE,
            image_bytes: rgba_image_bytes(extent),
        })
    }

    fn compile(&mut self, _device: &DeviceInfo, kernel: &KernelSource) -> ComputeResult<ProgramInfo> {
        let KernelSource::Text { path, source } = kernel else {
            return Err(ComputeError::CompileOrLink(format!(
                "{}: stream backend takes OpenCL C source",
                kernel.path().display()
            )));
        };
        let entry_point = kernel::entry_point(BackendKind::Stream);
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| ComputeError::ResourceAcquisition("no OpenCL context; acquire has not run".into()))?;

        // The error string carries the build log.
        let program = Program::create_and_build_from_source(context, source, "")
            .map_err(|log| ComputeError::CompileOrLink(format!("{}: {log}", path.display())))?;
        let program = self.program.insert(program);
        self.ledger.track(StreamHandle::Program);

        let compiled = Kernel::create(program, entry_point)
            .map_err(|e| ComputeError::CompileOrLink(format!("{}: no kernel '{entry_point}': {e}", path.display())))?;
        let args = compiled.num_args().unwrap_or(0) as usize;
        self.kernel = Some(compiled);
        self.ledger.track(StreamHandle::Kernel);
        if args != BINDING_LAYOUT.len() {
            return Err(ComputeError::CompileOrLink(format!(
                "{}: kernel '{entry_point}' takes {args} arguments, expected {} ({})",
                path.display(),
                BINDING_LAYOUT.len(),
                BINDING_LAYOUT.map(|b| b.name).join(", ")
            )));
        }

        info!(kernel = %path.display(), "program built");
        Ok(ProgramInfo {
            entry_point: entry_point.to_string(),
            source: path.clone(),
            bindings: args,
        })
    }

    fn dispatch(
        &mut self,
        _program: &ProgramInfo,
        resources: &ResourceSet,
        plan: &DispatchPlan,
    ) -> ComputeResult<SyncToken> {
        if self.extent != Some(resources.extent) {
            return Err(ComputeError::Synchronization(format!(
                "resource extent {} does not match allocated images",
                resources.extent
            )));
        }
        let (Some(queue), Some(kernel), Some(src), Some(dst)) =
            (self.queue.as_ref(), self.kernel.as_ref(), self.src.as_ref(), self.dst.as_ref())
        else {
            return Err(ComputeError::Synchronization("kernel or images missing".into()));
        };

        let mut recorder = StreamRecorder {
            queue,
            kernel,
            src,
            dst,
            bound: false,
            completion: None,
        };
        plan.record(&mut recorder)?;
        let event = recorder
            .completion
            .ok_or_else(|| ComputeError::Synchronization("plan enqueued no dispatch".into()))?;

        let waited = self.wait(&event)?;

        let (x, y, z) = plan.grid();
        debug!(x, y, z, ?waited, "dispatch complete");
        self.submissions += 1;
        self.pending = Some(self.submissions);
        Ok(SyncToken::new(BackendKind::Stream, self.submissions))
    }

    fn retrieve(&mut self, resources: &ResourceSet, token: SyncToken) -> ComputeResult<Vec<f32>> {
        if token.kind() != BackendKind::Stream || self.pending != Some(token.submission()) {
            return Err(ComputeError::Synchronization(format!(
                "stale token for submission {}",
                token.submission()
            )));
        }
        self.pending = None;
        let (Some(queue), Some(dst)) = (self.queue.as_ref(), self.dst.as_ref()) else {
            return Err(ComputeError::Validation("no destination image to read".into()));
        };

        let extent = resources.extent;
        let mut rgba = vec![0.0f32; extent.pixel_count() * RGBA_CHANNELS as usize];
        let origin = [0usize; 3];
        let region = [extent.width as usize, extent.height as usize, 1];
        let event = unsafe {
            // SAFETY: rgba has room for the whole region at tight row pitch.
            queue.enqueue_read_image(
                dst,
                CL_BLOCKING,
                origin.as_ptr(),
                region.as_ptr(),
                0,
                0,
                rgba.as_mut_ptr().cast(),
                &[],
            )
        }
        .map_err(|e| ComputeError::Synchronization(format!("clEnqueueReadImage failed: {e}")))?;
        event
            .wait()
            .map_err(|e| ComputeError::Synchronization(format!("read wait failed: {e}")))?;

        collapse_from_rgba(&rgba, resources.channels).map_err(|e| ComputeError::Validation(e.to_string()))
    }

    fn teardown(&mut self) -> usize {
        if let Some(queue) = &self.queue {
            if self.timed_out {
                warn!("kernel still outstanding; releasing without clFinish");
            } else if let Err(e) = queue.finish() {
                warn!(error = %e, "clFinish failed during teardown");
            }
        }
        self.timed_out = false;
        let mut ledger = std::mem::take(&mut self.ledger);
        let released = ledger.release_all(|handle| self.release(handle));
        self.extent = None;
        self.pending = None;
        if released > 0 {
            debug!(released, "opencl objects released");
        }
        released
    }

    fn live_handles(&self) -> usize {
        self.ledger.outstanding()
    }
}

impl Drop for StreamBackend {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Enqueues the plan on the in-order queue. Barriers are queue barriers;
/// kernel arguments are set at dispatch.
struct StreamRecorder<'a> {
    queue: &'a CommandQueue,
    kernel: &'a Kernel,
    src: &'a Image,
    dst: &'a Image,
    bound: bool,
    completion: Option<Event>,
}

impl StreamRecorder<'_> {
    fn barrier(&self) -> ComputeResult<()> {
        unsafe {
            // SAFETY: empty wait list.
            self.queue.enqueue_barrier_with_wait_list(&[])
        }
        .map(drop)
        .map_err(|e| ComputeError::Synchronization(format!("clEnqueueBarrierWithWaitList failed: {e}")))
    }
}

impl CommandRecorder for StreamRecorder<'_> {
    fn record(&mut self, command: Command) -> ComputeResult<()> {
        trace!(?command, "enqueue");
        match command {
            Command::UploadCopy | Command::ReadbackCopy => Err(ComputeError::Synchronization(format!(
                "{command:?} has no staging image on the stream backend"
            ))),
            Command::PreComputeBarrier | Command::PostComputeBarrier => self.barrier(),
            Command::BindProgram => {
                self.bound = true;
                Ok(())
            }
            Command::Dispatch { x, y, z } => {
                if !self.bound {
                    return Err(ComputeError::Synchronization("dispatch before bind".into()));
                }
                let event = unsafe {
                    // SAFETY: both arguments are image objects matching the
                    // kernel's two image2d_t parameters.
                    ExecuteKernel::new(self.kernel)
                        .set_arg(self.src)
                        .set_arg(self.dst)
                        .set_global_work_sizes(&[x as usize, y as usize, z as usize])
                        .enqueue_nd_range(self.queue)
                }
                .map_err(|e| ComputeError::Synchronization(format!("clEnqueueNDRangeKernel failed: {e}")))?;
                self.completion = Some(event);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_image_desc() {
        let desc = image_desc(Extent::new(8, 4));
        assert_eq!(desc.image_width, 8);
        assert_eq!(desc.image_height, 4);
        assert_eq!(desc.image_type, CL_MEM_OBJECT_IMAGE2D);
    }

    #[test]
    fn test_completion_state() {
        assert!(completion_state(CL_COMPLETE).unwrap());
        // CL_RUNNING, CL_SUBMITTED, CL_QUEUED
        for pending in [1, 2, 3] {
            assert!(!completion_state(pending).unwrap());
        }
        let err = completion_state(-5).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Synchronization);
        assert!(err.to_string().contains("-5"), "{err}");
    }

    #[test]
    fn test_teardown_before_acquire() {
        let mut backend = StreamBackend::new(&SessionConfig::default());
        assert_eq!(backend.teardown(), 0);
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn test_spirv_kernel_rejected() {
        let mut backend = StreamBackend::new(&SessionConfig::default());
        let device = DeviceInfo {
            kind: BackendKind::Stream,
            name: "none".into(),
            platform: "none".into(),
            queue_family: None,
        };
        let kernel = KernelSource::SpirV {
            path: "image.spv".into(),
            words: vec![crate::kernel::SPIRV_MAGIC],
        };
        assert_eq!(backend.compile(&device, &kernel).unwrap_err().kind(), ErrorKind::CompileOrLink);
    }
}
