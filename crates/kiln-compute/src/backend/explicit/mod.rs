//! Explicit-memory backend on Vulkan (ash).
//!
//! Everything the implicit backends leave to the driver is spelled out here:
//! memory types are matched per image, host data goes through linear
//! staging images, layouts change through barriers and completion is a
//! fence wait with a timeout.
//!
//! ```text
//! acquire   Entry -> Instance -> PhysicalDevice/queue family -> Device
//! allocate  4 images -> 4 memory blocks -> 2 views, upload into staging
//! compile   ShaderModule -> DescriptorSetLayout -> PipelineLayout -> Pipeline
//!           -> DescriptorPool/Set
//! dispatch  CommandPool/Buffer -> record plan -> Fence -> submit -> wait
//! validate  read staging -> collapse channels -> compare
//! teardown  ledger drained newest first
//! ```
//!
//! # Environment Variables
//!
//! - `KILN_FENCE_TIMEOUT_MS` - fence wait limit (default 4700)

pub mod device;
pub mod memory;
pub mod pipeline;

mod commands;

pub use device::select_queue_family;
pub use memory::select_memory_type;

use std::time::Duration;

use ash::vk;
use kiln_core::{Extent, PixelBuffer, collapse_from_rgba, expand_to_rgba};
use tracing::{debug, info, trace, warn};

use self::commands::VkRecorder;
use self::memory::ImageSet;
use self::pipeline::Program;
use super::{BackendKind, ComputeBackend, DeviceInfo, ProgramInfo, ResourceSet, SyncToken, rgba_image_bytes};
use crate::config::SessionConfig;
use crate::kernel::{self, BINDING_LAYOUT, KernelSource};
use crate::ledger::HandleLedger;
use crate::plan::{DispatchPlan, Staging};
use crate::{ComputeError, ComputeResult};

/// Every object the backend creates, in the ledger's creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VkHandle {
    Instance,
    Device,
    Image(vk::Image),
    Memory(vk::DeviceMemory),
    ImageView(vk::ImageView),
    ShaderModule(vk::ShaderModule),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    PipelineLayout(vk::PipelineLayout),
    Pipeline(vk::Pipeline),
    DescriptorPool(vk::DescriptorPool),
    CommandPool(vk::CommandPool),
    Fence(vk::Fence),
}

/// Vulkan lifecycle state.
pub struct ExplicitBackend {
    fence_timeout: Duration,
    entry: Option<ash::Entry>,
    instance: Option<ash::Instance>,
    device: Option<ash::Device>,
    physical: vk::PhysicalDevice,
    queue: vk::Queue,
    queue_family: u32,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    images: Option<ImageSet>,
    program: Option<Program>,
    descriptor_set: vk::DescriptorSet,
    submissions: u64,
    pending: Option<u64>,
    ledger: HandleLedger<VkHandle>,
}

impl ExplicitBackend {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            fence_timeout: config.fence_timeout,
            entry: None,
            instance: None,
            device: None,
            physical: vk::PhysicalDevice::null(),
            queue: vk::Queue::null(),
            queue_family: 0,
            memory_properties: vk::PhysicalDeviceMemoryProperties::default(),
            images: None,
            program: None,
            descriptor_set: vk::DescriptorSet::null(),
            submissions: 0,
            pending: None,
            ledger: HandleLedger::new(),
        }
    }

    /// Whether a loader is present and some device exposes a compute queue.
    pub fn is_available() -> bool {
        let Ok(entry) = device::load_entry() else {
            return false;
        };
        let Ok(instance) = device::create_instance(&entry) else {
            return false;
        };
        let found = device::select_device(&instance).is_ok();
        // SAFETY: nothing else was created from this instance.
        unsafe { instance.destroy_instance(None) };
        found
    }

    /// Extent of the allocated images, if any.
    pub fn extent(&self) -> Option<Extent> {
        self.images.map(|images| images.extent)
    }

    fn device(&self) -> ComputeResult<&ash::Device> {
        self.device
            .as_ref()
            .ok_or_else(|| ComputeError::ResourceAcquisition("no Vulkan device; acquire has not run".into()))
    }

    fn release(&mut self, handle: VkHandle) {
        trace!(?handle, "release");
        if let VkHandle::Instance = handle {
            if let Some(instance) = self.instance.take() {
                // SAFETY: the device and every child were released before this.
                unsafe { instance.destroy_instance(None) };
            }
            return;
        }
        if let VkHandle::Device = handle {
            if let Some(device) = self.device.take() {
                // SAFETY: every device child was released before this.
                unsafe { device.destroy_device(None) };
            }
            return;
        }
        let Some(device) = self.device.as_ref() else {
            warn!(?handle, "device already gone, handle dropped");
            return;
        };
        // SAFETY: each handle was created from `device`, the device is idle
        // and dependents were released first.
        unsafe {
            match handle {
                VkHandle::Image(image) => device.destroy_image(image, None),
                VkHandle::Memory(memory) => device.free_memory(memory, None),
                VkHandle::ImageView(view) => device.destroy_image_view(view, None),
                VkHandle::ShaderModule(module) => device.destroy_shader_module(module, None),
                VkHandle::DescriptorSetLayout(layout) => device.destroy_descriptor_set_layout(layout, None),
                VkHandle::PipelineLayout(layout) => device.destroy_pipeline_layout(layout, None),
                VkHandle::Pipeline(pipeline) => device.destroy_pipeline(pipeline, None),
                VkHandle::DescriptorPool(pool) => device.destroy_descriptor_pool(pool, None),
                VkHandle::CommandPool(pool) => device.destroy_command_pool(pool, None),
                VkHandle::Fence(fence) => device.destroy_fence(fence, None),
                VkHandle::Instance | VkHandle::Device => {}
            }
        }
    }
}

impl ComputeBackend for ExplicitBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Explicit
    }

    fn acquire(&mut self) -> ComputeResult<DeviceInfo> {
        let entry = device::load_entry()?;
        let instance = device::create_instance(&entry)?;
        self.entry = Some(entry);
        self.ledger.track(VkHandle::Instance);
        let instance = self.instance.insert(instance);

        let selection = device::select_device(instance)?;
        let (name, platform) = device::describe(instance, selection.physical);
        // SAFETY: physical belongs to instance.
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(selection.physical) };
        let (logical, queue) = device::create_device(instance, selection)?;

        self.device = Some(logical);
        self.ledger.track(VkHandle::Device);
        self.physical = selection.physical;
        self.queue = queue;
        self.queue_family = selection.queue_family;
        self.memory_properties = memory_properties;

        Ok(DeviceInfo {
            kind: BackendKind::Explicit,
            name,
            platform,
            queue_family: Some(selection.queue_family),
        })
    }

    fn allocate(&mut self, _device: &DeviceInfo, image: &PixelBuffer) -> ComputeResult<ResourceSet> {
        let extent = image.extent();
        let max = self
            .instance
            .as_ref()
            .map(|instance| device::max_image_dimension(instance, self.physical))
            .unwrap_or(0);
        if extent.width > max || extent.height > max {
            return Err(ComputeError::MemoryAllocation(format!(
                "{extent} exceeds the device limit of {max} per side"
            )));
        }
        let rgba =
            expand_to_rgba(image.data(), image.channels()).map_err(|e| ComputeError::MemoryAllocation(e.to_string()))?;

        let memory_properties = self.memory_properties;
        let (Some(instance), Some(logical)) = (self.instance.as_ref(), self.device.as_ref()) else {
            return Err(ComputeError::ResourceAcquisition("no Vulkan device; acquire has not run".into()));
        };
        let images = memory::create_image_set(
            instance,
            self.physical,
            logical,
            &memory_properties,
            extent,
            &mut self.ledger,
        )?;
        self.images = Some(images);
        memory::write_staging(logical, &images.staging_src, extent, &rgba)?;
        debug!(%extent, channels = image.channels(), "images allocated and staged");

        Ok(ResourceSet {
            extent,
            channels: image.channels(),
            staging: Staging::FULL,
            image_bytes: rgba_image_bytes(extent),
        })
    }

    fn compile(&mut self, _device: &DeviceInfo, kernel: &KernelSource) -> ComputeResult<ProgramInfo> {
        let entry_point = kernel::entry_point(BackendKind::Explicit);
        let words = pipeline::spirv_words(kernel, entry_point)?;
        let images = self
            .images
            .ok_or_else(|| ComputeError::CompileOrLink("images must be allocated before binding".into()))?;

        let logical = self
            .device
            .as_ref()
            .ok_or_else(|| ComputeError::ResourceAcquisition("no Vulkan device; acquire has not run".into()))?;
        let program = pipeline::create_program(logical, &words, entry_point, &mut self.ledger)?;
        self.program = Some(program);
        self.descriptor_set = commands::bind_descriptors(logical, &program, &images, &mut self.ledger)?;

        info!(kernel = %kernel.path().display(), spirv_words = words.len(), "pipeline ready");
        Ok(ProgramInfo {
            entry_point: entry_point.to_string(),
            source: kernel.path().to_path_buf(),
            bindings: BINDING_LAYOUT.len(),
        })
    }

    fn dispatch(
        &mut self,
        _program: &ProgramInfo,
        resources: &ResourceSet,
        plan: &DispatchPlan,
    ) -> ComputeResult<SyncToken> {
        let images = self
            .images
            .ok_or_else(|| ComputeError::Synchronization("no images to dispatch over".into()))?;
        let program = self
            .program
            .ok_or_else(|| ComputeError::Synchronization("no pipeline to dispatch".into()))?;
        if images.extent != resources.extent {
            return Err(ComputeError::Synchronization(format!(
                "resource extent {} does not match allocated {}",
                resources.extent, images.extent
            )));
        }

        let logical = self
            .device
            .as_ref()
            .ok_or_else(|| ComputeError::ResourceAcquisition("no Vulkan device; acquire has not run".into()))?;
        let cmd = commands::create_command_buffer(logical, self.queue_family, &mut self.ledger)?;
        let mut recorder = VkRecorder::begin(logical, cmd, &images, &program, self.descriptor_set)?;
        plan.record(&mut recorder)?;
        let cmd = recorder.finish()?;

        let fence = commands::create_fence(logical, &mut self.ledger)?;
        let (x, y, z) = plan.grid();
        debug!(x, y, z, commands = plan.commands().len(), "submitting");
        commands::submit_and_wait(logical, self.queue, cmd, fence, self.fence_timeout)?;

        self.submissions += 1;
        self.pending = Some(self.submissions);
        Ok(SyncToken::new(BackendKind::Explicit, self.submissions))
    }

    fn retrieve(&mut self, resources: &ResourceSet, token: SyncToken) -> ComputeResult<Vec<f32>> {
        if token.kind() != BackendKind::Explicit || self.pending != Some(token.submission()) {
            return Err(ComputeError::Synchronization(format!(
                "stale token for submission {}",
                token.submission()
            )));
        }
        self.pending = None;
        let images = self
            .images
            .ok_or_else(|| ComputeError::Validation("no images to read back".into()))?;
        let rgba = memory::read_staging(self.device()?, &images.staging_dst, resources.extent)?;
        collapse_from_rgba(&rgba, resources.channels).map_err(|e| ComputeError::Validation(e.to_string()))
    }

    fn teardown(&mut self) -> usize {
        if let Some(logical) = &self.device {
            // SAFETY: device is valid; waiting makes every child safe to destroy.
            if let Err(e) = unsafe { logical.device_wait_idle() } {
                warn!(error = %e, "vkDeviceWaitIdle failed during teardown");
            }
        }
        let mut ledger = std::mem::take(&mut self.ledger);
        let released = ledger.release_all(|handle| self.release(handle));

        self.images = None;
        self.program = None;
        self.descriptor_set = vk::DescriptorSet::null();
        self.pending = None;
        self.queue = vk::Queue::null();
        self.physical = vk::PhysicalDevice::null();
        self.entry = None;
        if released > 0 {
            debug!(released, "vulkan objects released");
        }
        released
    }

    fn live_handles(&self) -> usize {
        self.ledger.outstanding()
    }
}

impl Drop for ExplicitBackend {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_new_holds_nothing() {
        let backend = ExplicitBackend::new(&SessionConfig::default());
        assert_eq!(backend.live_handles(), 0);
        assert!(backend.extent().is_none());
        assert_eq!(backend.kind(), BackendKind::Explicit);
    }

    #[test]
    fn test_teardown_before_acquire() {
        let mut backend = ExplicitBackend::new(&SessionConfig::default());
        assert_eq!(backend.teardown(), 0);
        assert_eq!(backend.teardown(), 0);
    }

    #[test]
    fn test_retrieve_without_dispatch_is_stale() {
        let mut backend = ExplicitBackend::new(&SessionConfig::default());
        let resources = ResourceSet {
            extent: Extent::new(1, 1),
            channels: 4,
            staging: Staging::FULL,
            image_bytes: 16,
        };
        let err = backend
            .retrieve(&resources, SyncToken::new(BackendKind::Explicit, 1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Synchronization);
    }

    #[test]
    fn test_compile_before_allocate_fails() {
        let mut backend = ExplicitBackend::new(&SessionConfig::default());
        let device = DeviceInfo {
            kind: BackendKind::Explicit,
            name: "none".into(),
            platform: "none".into(),
            queue_family: None,
        };
        let kernel = KernelSource::load(BackendKind::Explicit, &crate::config::default_kernel_dir()).unwrap();
        let err = backend.compile(&device, &kernel).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CompileOrLink);
    }
}
