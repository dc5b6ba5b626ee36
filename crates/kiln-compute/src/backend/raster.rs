//! Raster-compute backend on wgpu.
//!
//! The compute pass lives inside a graphics API: memory is implicit, the
//! source texture is filled with a queue write and the result is copied into
//! a mappable buffer. Barriers between pass and copy are inserted by wgpu,
//! so the barrier commands of the plan only check ordering.
//!
//! Completion is awaited with a bounded poll loop on
//! `Queue::on_submitted_work_done`, limited by the session's fence timeout.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use kiln_core::{Extent, PixelBuffer, RGBA_CHANNELS, collapse_from_rgba, expand_to_rgba};
use tracing::{debug, error, info, trace};

use super::{BackendKind, ComputeBackend, DeviceInfo, ProgramInfo, ResourceSet, SyncToken, rgba_image_bytes};
use crate::config::SessionConfig;
use crate::kernel::{self, BINDING_LAYOUT, KernelSource};
use crate::ledger::HandleLedger;
use crate::plan::{Command, CommandRecorder, DispatchPlan, Staging};
use crate::{ComputeError, ComputeResult};

const FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;
const TEXEL_BYTES: u32 = RGBA_CHANNELS * std::mem::size_of::<f32>() as u32;
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Objects owned by the backend, in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterHandle {
    Instance,
    Adapter,
    Device,
    SourceTexture,
    DestTexture,
    ReadbackBuffer,
    SourceView,
    DestView,
    ShaderModule,
    BindGroupLayout,
    PipelineLayout,
    Pipeline,
    BindGroup,
}

/// Row pitch of the readback buffer, padded to the copy alignment.
fn padded_row_bytes(width: u32) -> u32 {
    let unpadded = width * TEXEL_BYTES;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

/// wgpu lifecycle state.
pub struct RasterComputeBackend {
    timeout: Duration,
    instance: Option<wgpu::Instance>,
    adapter: Option<wgpu::Adapter>,
    device: Option<wgpu::Device>,
    queue: Option<wgpu::Queue>,
    src: Option<wgpu::Texture>,
    dst: Option<wgpu::Texture>,
    readback: Option<wgpu::Buffer>,
    src_view: Option<wgpu::TextureView>,
    dst_view: Option<wgpu::TextureView>,
    module: Option<wgpu::ShaderModule>,
    bind_group_layout: Option<wgpu::BindGroupLayout>,
    pipeline_layout: Option<wgpu::PipelineLayout>,
    pipeline: Option<wgpu::ComputePipeline>,
    bind_group: Option<wgpu::BindGroup>,
    extent: Option<Extent>,
    submissions: u64,
    pending: Option<u64>,
    ledger: HandleLedger<RasterHandle>,
}

fn missing(what: &str) -> ComputeError {
    ComputeError::ResourceAcquisition(format!("no {what}; earlier step has not run"))
}

impl RasterComputeBackend {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            timeout: config.fence_timeout,
            instance: None,
            adapter: None,
            device: None,
            queue: None,
            src: None,
            dst: None,
            readback: None,
            src_view: None,
            dst_view: None,
            module: None,
            bind_group_layout: None,
            pipeline_layout: None,
            pipeline: None,
            bind_group: None,
            extent: None,
            submissions: 0,
            pending: None,
            ledger: HandleLedger::new(),
        }
    }

    /// Check if any wgpu adapter is present.
    pub fn is_available() -> bool {
        pollster::block_on(async {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });
            instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .is_some()
        })
    }

    fn device(&self) -> ComputeResult<&wgpu::Device> {
        self.device.as_ref().ok_or_else(|| missing("wgpu device"))
    }

    fn queue(&self) -> ComputeResult<&wgpu::Queue> {
        self.queue.as_ref().ok_or_else(|| missing("wgpu queue"))
    }

    /// Pops the error scope pushed before a step and maps a captured error.
    fn pop_scope(&self, map: impl FnOnce(String) -> ComputeError) -> ComputeResult<()> {
        let device = self.device()?;
        match pollster::block_on(device.pop_error_scope()) {
            Some(e) => Err(map(e.to_string())),
            None => Ok(()),
        }
    }

    /// Polls until `rx` fires or the timeout runs out.
    fn wait(&self, rx: &mpsc::Receiver<()>, what: &str) -> ComputeResult<()> {
        let device = self.device()?;
        let start = Instant::now();
        loop {
            let _ = device.poll(wgpu::Maintain::Poll);
            match rx.try_recv() {
                Ok(()) => return Ok(()),
                Err(mpsc::TryRecvError::Disconnected) => {
                    return Err(ComputeError::Synchronization(format!("{what}: callback dropped")));
                }
                Err(mpsc::TryRecvError::Empty) => {}
            }
            if start.elapsed() >= self.timeout {
                return Err(ComputeError::Synchronization(format!(
                    "{what} not signaled within {:?}",
                    self.timeout
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Waits like [`Self::wait`], then pops the validation scope pushed
    /// before submit whether or not the wait succeeded.
    fn wait_scoped(&self, rx: &mpsc::Receiver<()>, what: &str) -> ComputeResult<()> {
        let waited = self.wait(rx, what);
        let popped = self.pop_scope(|e| ComputeError::Synchronization(format!("dispatch failed: {e}")));
        waited.and(popped)
    }

    fn release(&mut self, handle: RasterHandle) {
        trace!(?handle, "release");
        match handle {
            RasterHandle::Instance => drop(self.instance.take()),
            RasterHandle::Adapter => drop(self.adapter.take()),
            RasterHandle::Device => {
                self.queue = None;
                if let Some(device) = self.device.take() {
                    device.destroy();
                }
            }
            RasterHandle::SourceTexture => {
                if let Some(texture) = self.src.take() {
                    texture.destroy();
                }
            }
            RasterHandle::DestTexture => {
                if let Some(texture) = self.dst.take() {
                    texture.destroy();
                }
            }
            RasterHandle::ReadbackBuffer => {
                if let Some(buffer) = self.readback.take() {
                    buffer.destroy();
                }
            }
            RasterHandle::SourceView => drop(self.src_view.take()),
            RasterHandle::DestView => drop(self.dst_view.take()),
            RasterHandle::ShaderModule => drop(self.module.take()),
            RasterHandle::BindGroupLayout => drop(self.bind_group_layout.take()),
            RasterHandle::PipelineLayout => drop(self.pipeline_layout.take()),
            RasterHandle::Pipeline => drop(self.pipeline.take()),
            RasterHandle::BindGroup => drop(self.bind_group.take()),
        }
    }

    fn create_texture(device: &wgpu::Device, label: &str, extent: Extent, usage: wgpu::TextureUsages) -> wgpu::Texture {
        device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: extent.width,
                height: extent.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: FORMAT,
            usage,
            view_formats: &[],
        })
    }
}

impl ComputeBackend for RasterComputeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::RasterCompute
    }

    fn acquire(&mut self) -> ComputeResult<DeviceInfo> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let instance = self.instance.insert(instance);
        self.ledger.track(RasterHandle::Instance);

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| ComputeError::ResourceAcquisition("no capable device found".into()))?;
        let adapter = self.adapter.insert(adapter);
        self.ledger.track(RasterHandle::Adapter);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("kiln_device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
                ..Default::default()
            },
            None,
        ))
        .map_err(|e| ComputeError::ResourceAcquisition(format!("request_device failed: {e}")))?;
        device.on_uncaptured_error(Box::new(|e| error!(error = %e, "uncaptured wgpu error")));

        let info = adapter.get_info();
        self.device = Some(device);
        self.queue = Some(queue);
        self.ledger.track(RasterHandle::Device);

        Ok(DeviceInfo {
            kind: BackendKind::RasterCompute,
            name: info.name,
            platform: format!("{:?}", info.backend),
            queue_family: None,
        })
    }

    fn allocate(&mut self, _device: &DeviceInfo, image: &PixelBuffer) -> ComputeResult<ResourceSet> {
        let extent = image.extent();
        let device = self.device.as_ref().ok_or_else(|| missing("wgpu device"))?;
        let max = device.limits().max_texture_dimension_2d;
        if extent.width > max || extent.height > max {
            return Err(ComputeError::MemoryAllocation(format!(
                "{extent} exceeds the device limit of {max} per side"
            )));
        }
        let rgba =
            expand_to_rgba(image.data(), image.channels()).map_err(|e| ComputeError::MemoryAllocation(e.to_string()))?;

        let queue = self.queue.as_ref().ok_or_else(|| missing("wgpu queue"))?;

        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let src = Self::create_texture(
            device,
            "kiln_src",
            extent,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        );
        self.ledger.track(RasterHandle::SourceTexture);
        let dst = Self::create_texture(
            device,
            "kiln_dst",
            extent,
            wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::COPY_SRC,
        );
        self.ledger.track(RasterHandle::DestTexture);
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("kiln_readback"),
            size: padded_row_bytes(extent.width) as u64 * extent.height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        self.ledger.track(RasterHandle::ReadbackBuffer);

        let src_view = src.create_view(&wgpu::TextureViewDescriptor::default());
        self.ledger.track(RasterHandle::SourceView);
        let dst_view = dst.create_view(&wgpu::TextureViewDescriptor::default());
        self.ledger.track(RasterHandle::DestView);

        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &src,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&rgba),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(extent.width * TEXEL_BYTES),
                rows_per_image: Some(extent.height),
            },
            wgpu::Extent3d {
                width: extent.width,
                height: extent.height,
                depth_or_array_layers: 1,
            },
        );

        self.src = Some(src);
        self.dst = Some(dst);
        self.readback = Some(readback);
        self.src_view = Some(src_view);
        self.dst_view = Some(dst_view);
        self.extent = Some(extent);

        self.pop_scope(|e| ComputeError::MemoryAllocation(format!("texture creation failed: {e}")))?;
        self.pop_scope(|e| ComputeError::MemoryAllocation(format!("out of memory: {e}")))?;
        debug!(%extent, channels = image.channels(), "textures allocated and uploaded");

        Ok(ResourceSet {
            extent,
            channels: image.channels(),
            staging: Staging::READBACK_ONLY,
            image_bytes: rgba_image_bytes(extent),
        })
    }

    fn compile(&mut self, _device: &DeviceInfo, kernel: &KernelSource) -> ComputeResult<ProgramInfo> {
        let KernelSource::Text { path, source } = kernel else {
            return Err(ComputeError::CompileOrLink(format!(
                "{}: raster backend takes WGSL source",
                kernel.path().display()
            )));
        };
        let entry_point = kernel::entry_point(BackendKind::RasterCompute);
        let device = self.device.as_ref().ok_or_else(|| missing("wgpu device"))?;
        let (Some(src_view), Some(dst_view)) = (self.src_view.as_ref(), self.dst_view.as_ref()) else {
            return Err(ComputeError::CompileOrLink("textures must be allocated before binding".into()));
        };

        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("kiln_kernel"),
            source: wgpu::ShaderSource::Wgsl(source.as_str().into()),
        });
        self.ledger.track(RasterHandle::ShaderModule);

        let diagnostics = pollster::block_on(module.get_compilation_info());
        let errors: Vec<String> = diagnostics
            .messages
            .iter()
            .filter(|m| matches!(m.message_type, wgpu::CompilationMessageType::Error))
            .map(|m| m.message.clone())
            .collect();

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("kiln_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: BINDING_LAYOUT[0].slot,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: BINDING_LAYOUT[1].slot,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: FORMAT,
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
            ],
        });
        self.ledger.track(RasterHandle::BindGroupLayout);

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("kiln_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        self.ledger.track(RasterHandle::PipelineLayout);

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("kiln_pipeline"),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some(entry_point),
            compilation_options: Default::default(),
            cache: None,
        });
        self.ledger.track(RasterHandle::Pipeline);

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kiln_bind_group"),
            layout: &bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: BINDING_LAYOUT[0].slot,
                    resource: wgpu::BindingResource::TextureView(src_view),
                },
                wgpu::BindGroupEntry {
                    binding: BINDING_LAYOUT[1].slot,
                    resource: wgpu::BindingResource::TextureView(dst_view),
                },
            ],
        });
        self.ledger.track(RasterHandle::BindGroup);

        self.module = Some(module);
        self.bind_group_layout = Some(bind_group_layout);
        self.pipeline_layout = Some(pipeline_layout);
        self.pipeline = Some(pipeline);
        self.bind_group = Some(bind_group);

        let scoped = self.pop_scope(|e| ComputeError::CompileOrLink(format!("{}: {e}", path.display())));
        if !errors.is_empty() {
            return Err(ComputeError::CompileOrLink(format!("{}: {}", path.display(), errors.join("; "))));
        }
        scoped?;

        info!(kernel = %path.display(), "pipeline ready");
        Ok(ProgramInfo {
            entry_point: entry_point.to_string(),
            source: path.clone(),
            bindings: BINDING_LAYOUT.len(),
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
                "resource extent {} does not match allocated textures",
                resources.extent
            )));
        }
        let device = self.device()?;
        let (Some(pipeline), Some(bind_group), Some(dst), Some(readback)) = (
            self.pipeline.as_ref(),
            self.bind_group.as_ref(),
            self.dst.as_ref(),
            self.readback.as_ref(),
        ) else {
            return Err(ComputeError::Synchronization("pipeline or textures missing".into()));
        };

        let queue = self.queue()?;
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("kiln_encoder"),
        });
        let mut recorder = RasterRecorder {
            encoder: &mut encoder,
            pipeline,
            bind_group,
            dst,
            readback,
            extent: resources.extent,
            bound: false,
            dispatched: false,
        };
        plan.record(&mut recorder)?;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        queue.submit(std::iter::once(encoder.finish()));
        let (tx, rx) = mpsc::channel();
        queue.on_submitted_work_done(move || {
            let _ = tx.send(());
        });
        self.wait_scoped(&rx, "submitted work")?;

        let (x, y, z) = plan.grid();
        debug!(x, y, z, "dispatch complete");
        self.submissions += 1;
        self.pending = Some(self.submissions);
        Ok(SyncToken::new(BackendKind::RasterCompute, self.submissions))
    }

    fn retrieve(&mut self, resources: &ResourceSet, token: SyncToken) -> ComputeResult<Vec<f32>> {
        if token.kind() != BackendKind::RasterCompute || self.pending != Some(token.submission()) {
            return Err(ComputeError::Synchronization(format!(
                "stale token for submission {}",
                token.submission()
            )));
        }
        self.pending = None;
        let readback = self
            .readback
            .as_ref()
            .ok_or_else(|| ComputeError::Validation("no readback buffer".into()))?;

        let slice = readback.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        let _ = self.device()?.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| ComputeError::Synchronization("map channel closed".into()))?
            .map_err(|e| ComputeError::Synchronization(format!("map failed: {e}")))?;

        let extent = resources.extent;
        let row_bytes = (extent.width * TEXEL_BYTES) as usize;
        let pitch = padded_row_bytes(extent.width) as usize;
        let mut rgba = Vec::with_capacity(extent.pixel_count() * RGBA_CHANNELS as usize);
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks_exact(pitch).take(extent.height as usize) {
                rgba.extend_from_slice(bytemuck::cast_slice::<u8, f32>(&row[..row_bytes]));
            }
        }
        readback.unmap();

        collapse_from_rgba(&rgba, resources.channels).map_err(|e| ComputeError::Validation(e.to_string()))
    }

    fn teardown(&mut self) -> usize {
        if let Some(device) = &self.device {
            let _ = device.poll(wgpu::Maintain::Wait);
        }
        let mut ledger = std::mem::take(&mut self.ledger);
        let released = ledger.release_all(|handle| self.release(handle));
        self.extent = None;
        self.pending = None;
        if released > 0 {
            debug!(released, "wgpu objects released");
        }
        released
    }

    fn live_handles(&self) -> usize {
        self.ledger.outstanding()
    }
}

impl Drop for RasterComputeBackend {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Records the plan into one encoder. The compute pass is opened and closed
/// around the dispatch.
struct RasterRecorder<'a> {
    encoder: &'a mut wgpu::CommandEncoder,
    pipeline: &'a wgpu::ComputePipeline,
    bind_group: &'a wgpu::BindGroup,
    dst: &'a wgpu::Texture,
    readback: &'a wgpu::Buffer,
    extent: Extent,
    bound: bool,
    dispatched: bool,
}

impl CommandRecorder for RasterRecorder<'_> {
    fn record(&mut self, command: Command) -> ComputeResult<()> {
        trace!(?command, "record");
        match command {
            Command::UploadCopy => {
                return Err(ComputeError::Synchronization(
                    "raster backend uploads at allocation, not through a staging copy".into(),
                ));
            }
            // Implicit in wgpu.
            Command::PreComputeBarrier | Command::PostComputeBarrier => {}
            Command::BindProgram => self.bound = true,
            Command::Dispatch { x, y, z } => {
                if !self.bound {
                    return Err(ComputeError::Synchronization("dispatch before bind".into()));
                }
                let mut pass = self.encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("kiln_pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(self.pipeline);
                pass.set_bind_group(0, self.bind_group, &[]);
                pass.dispatch_workgroups(x, y, z);
                self.dispatched = true;
            }
            Command::ReadbackCopy => {
                if !self.dispatched {
                    return Err(ComputeError::Synchronization("readback before dispatch".into()));
                }
                self.encoder.copy_texture_to_buffer(
                    wgpu::TexelCopyTextureInfo {
                        texture: self.dst,
                        mip_level: 0,
                        origin: wgpu::Origin3d::ZERO,
                        aspect: wgpu::TextureAspect::All,
                    },
                    wgpu::TexelCopyBufferInfo {
                        buffer: self.readback,
                        layout: wgpu::TexelCopyBufferLayout {
                            offset: 0,
                            bytes_per_row: Some(padded_row_bytes(self.extent.width)),
                            rows_per_image: Some(self.extent.height),
                        },
                    },
                    wgpu::Extent3d {
                        width: self.extent.width,
                        height: self.extent.height,
                        depth_or_array_layers: 1,
                    },
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_padded_row_bytes() {
        assert_eq!(padded_row_bytes(1), 256);
        assert_eq!(padded_row_bytes(16), 256);
        assert_eq!(padded_row_bytes(17), 512);
        assert_eq!(padded_row_bytes(8) % wgpu::COPY_BYTES_PER_ROW_ALIGNMENT, 0);
    }

    #[test]
    fn test_teardown_before_acquire() {
        let mut backend = RasterComputeBackend::new(&SessionConfig::default());
        assert_eq!(backend.live_handles(), 0);
        assert_eq!(backend.teardown(), 0);
    }

    #[test]
    fn test_spirv_kernel_rejected() {
        let mut backend = RasterComputeBackend::new(&SessionConfig::default());
        let device = DeviceInfo {
            kind: BackendKind::RasterCompute,
            name: "none".into(),
            platform: "none".into(),
            queue_family: None,
        };
        let kernel = KernelSource::SpirV {
            path: "image.spv".into(),
            words: vec![crate::kernel::SPIRV_MAGIC],
        };
        let err = backend.compile(&device, &kernel).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CompileOrLink);
    }

    #[test]
    fn test_retrieve_without_dispatch_is_stale() {
        let mut backend = RasterComputeBackend::new(&SessionConfig::default());
        let resources = ResourceSet {
            extent: Extent::new(1, 1),
            channels: 4,
            staging: Staging::READBACK_ONLY,
            image_bytes: 16,
        };
        let err = backend
            .retrieve(&resources, SyncToken::new(BackendKind::RasterCompute, 1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Synchronization);
    }

    #[test]
    fn test_failed_wait_pops_error_scope() {
        let config = SessionConfig::default().with_fence_timeout(Duration::from_millis(5));
        let mut backend = RasterComputeBackend::new(&config);
        if let Err(e) = backend.acquire() {
            println!("skipped: {e}");
            return;
        }
        let device = backend.device().unwrap();
        let uncaptured = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = uncaptured.clone();
        device.on_uncaptured_error(Box::new(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let (tx, rx) = mpsc::channel::<()>();
        drop(tx);
        let err = backend.wait_scoped(&rx, "submitted work").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Synchronization);

        // With no scope left open, a validation error reaches the handler.
        let device = backend.device().unwrap();
        let _ = device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: 16,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::MAP_WRITE,
            mapped_at_creation: false,
        });
        let _ = device.poll(wgpu::Maintain::Wait);
        assert_eq!(uncaptured.load(std::sync::atomic::Ordering::SeqCst), 1);
        backend.teardown();
    }
}
