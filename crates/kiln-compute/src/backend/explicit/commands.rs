//! Descriptor binding, command recording, submission and the fence wait.

use std::time::Duration;

use ash::vk;
use tracing::{debug, trace};

use super::memory::{COLOR_LAYERS, COLOR_RANGE, ImageSet};
use super::pipeline::Program;
use super::VkHandle;
use crate::kernel::BINDING_LAYOUT;
use crate::ledger::HandleLedger;
use crate::plan::{Command, CommandRecorder};
use crate::{ComputeError, ComputeResult};

/// Pool with room for exactly the two storage images of one set.
pub fn bind_descriptors(
    device: &ash::Device,
    program: &Program,
    images: &ImageSet,
    ledger: &mut HandleLedger<VkHandle>,
) -> ComputeResult<vk::DescriptorSet> {
    let pool_sizes = [vk::DescriptorPoolSize {
        ty: vk::DescriptorType::STORAGE_IMAGE,
        descriptor_count: BINDING_LAYOUT.len() as u32,
    }];
    let pool_info = vk::DescriptorPoolCreateInfo::default()
        .max_sets(1)
        .pool_sizes(&pool_sizes);
    let pool = unsafe {
        // SAFETY: pool_sizes outlives the call.
        device.create_descriptor_pool(&pool_info, None)
    }
    .map_err(|e| ComputeError::MemoryAllocation(format!("vkCreateDescriptorPool failed: {e}")))?;
    ledger.track(VkHandle::DescriptorPool(pool));

    let set_layouts = [program.set_layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&set_layouts);
    // Freed with the pool.
    let set = unsafe {
        // SAFETY: pool and layout are live.
        device.allocate_descriptor_sets(&alloc_info)
    }
    .map_err(|e| ComputeError::MemoryAllocation(format!("vkAllocateDescriptorSets failed: {e}")))?
    .into_iter()
    .next()
    .ok_or_else(|| ComputeError::MemoryAllocation("no descriptor set allocated".into()))?;

    let views = [images.src_view, images.dst_view];
    let image_infos: Vec<vk::DescriptorImageInfo> = views
        .iter()
        .map(|&view| {
            vk::DescriptorImageInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::GENERAL)
        })
        .collect();
    let writes: Vec<vk::WriteDescriptorSet> = BINDING_LAYOUT
        .iter()
        .zip(&image_infos)
        .map(|(binding, info)| {
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(binding.slot)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(std::slice::from_ref(info))
        })
        .collect();
    unsafe {
        // SAFETY: set, views and infos are live.
        device.update_descriptor_sets(&writes, &[]);
    }
    Ok(set)
}

/// One primary command buffer from a fresh pool.
pub fn create_command_buffer(
    device: &ash::Device,
    queue_family: u32,
    ledger: &mut HandleLedger<VkHandle>,
) -> ComputeResult<vk::CommandBuffer> {
    let pool_info = vk::CommandPoolCreateInfo::default().queue_family_index(queue_family);
    let pool = unsafe {
        // SAFETY: queue_family was used to create device.
        device.create_command_pool(&pool_info, None)
    }
    .map_err(|e| ComputeError::MemoryAllocation(format!("vkCreateCommandPool failed: {e}")))?;
    ledger.track(VkHandle::CommandPool(pool));

    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    // Freed with the pool.
    unsafe {
        // SAFETY: pool is live.
        device.allocate_command_buffers(&alloc_info)
    }
    .map_err(|e| ComputeError::MemoryAllocation(format!("vkAllocateCommandBuffers failed: {e}")))?
    .into_iter()
    .next()
    .ok_or_else(|| ComputeError::MemoryAllocation("no command buffer allocated".into()))
}

pub fn create_fence(device: &ash::Device, ledger: &mut HandleLedger<VkHandle>) -> ComputeResult<vk::Fence> {
    let fence = unsafe {
        // SAFETY: device is valid.
        device.create_fence(&vk::FenceCreateInfo::default(), None)
    }
    .map_err(|e| ComputeError::Synchronization(format!("vkCreateFence failed: {e}")))?;
    ledger.track(VkHandle::Fence(fence));
    Ok(fence)
}

/// Submits `cmd` once and blocks until `fence` signals or `timeout` runs out.
pub fn submit_and_wait(
    device: &ash::Device,
    queue: vk::Queue,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
    timeout: Duration,
) -> ComputeResult<()> {
    let command_buffers = [cmd];
    let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);
    unsafe {
        // SAFETY: cmd is fully recorded, fence is unsignaled.
        device.queue_submit(queue, std::slice::from_ref(&submit), fence)
    }
    .map_err(|e| ComputeError::Synchronization(format!("vkQueueSubmit failed: {e}")))?;

    let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
    match unsafe {
        // SAFETY: fence was submitted above.
        device.wait_for_fences(&[fence], true, timeout_ns)
    } {
        Ok(()) => {
            debug!(?fence, "fence signaled");
            Ok(())
        }
        Err(vk::Result::TIMEOUT) => Err(ComputeError::Synchronization(format!(
            "fence not signaled within {timeout:?}"
        ))),
        Err(e) => Err(ComputeError::Synchronization(format!("vkWaitForFences failed: {e}"))),
    }
}

fn image_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(COLOR_RANGE)
}

/// Records plan commands into a Vulkan command buffer, tracking the source
/// image layout so the pre-compute barrier transitions from the right state.
pub struct VkRecorder<'a> {
    device: &'a ash::Device,
    cmd: vk::CommandBuffer,
    images: &'a ImageSet,
    program: &'a Program,
    set: vk::DescriptorSet,
    src_layout: vk::ImageLayout,
}

impl<'a> VkRecorder<'a> {
    pub fn begin(
        device: &'a ash::Device,
        cmd: vk::CommandBuffer,
        images: &'a ImageSet,
        program: &'a Program,
        set: vk::DescriptorSet,
    ) -> ComputeResult<Self> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            // SAFETY: cmd is freshly allocated and not recording.
            device.begin_command_buffer(cmd, &begin_info)
        }
        .map_err(|e| ComputeError::Synchronization(format!("vkBeginCommandBuffer failed: {e}")))?;
        Ok(Self {
            device,
            cmd,
            images,
            program,
            set,
            src_layout: vk::ImageLayout::UNDEFINED,
        })
    }

    pub fn finish(self) -> ComputeResult<vk::CommandBuffer> {
        unsafe {
            // SAFETY: cmd is recording.
            self.device.end_command_buffer(self.cmd)
        }
        .map_err(|e| ComputeError::Synchronization(format!("vkEndCommandBuffer failed: {e}")))?;
        Ok(self.cmd)
    }

    fn barrier(
        &self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        unsafe {
            // SAFETY: cmd is recording; every image in barriers is live.
            self.device
                .cmd_pipeline_barrier(self.cmd, src_stage, dst_stage, vk::DependencyFlags::empty(), &[], &[], barriers);
        }
    }

    fn copy(&self, src: vk::Image, dst: vk::Image) {
        let region = vk::ImageCopy {
            src_subresource: COLOR_LAYERS,
            src_offset: vk::Offset3D::default(),
            dst_subresource: COLOR_LAYERS,
            dst_offset: vk::Offset3D::default(),
            extent: vk::Extent3D {
                width: self.images.extent.width,
                height: self.images.extent.height,
                depth: 1,
            },
        };
        unsafe {
            // SAFETY: src is in TRANSFER_SRC_OPTIMAL, dst in TRANSFER_DST_OPTIMAL.
            self.device.cmd_copy_image(
                self.cmd,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }
}

impl CommandRecorder for VkRecorder<'_> {
    fn record(&mut self, command: Command) -> ComputeResult<()> {
        trace!(?command, "record");
        let images = self.images;
        match command {
            Command::UploadCopy => {
                self.barrier(
                    vk::PipelineStageFlags::HOST,
                    vk::PipelineStageFlags::TRANSFER,
                    &[
                        image_barrier(
                            images.staging_src.image,
                            vk::ImageLayout::PREINITIALIZED,
                            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            vk::AccessFlags::HOST_WRITE,
                            vk::AccessFlags::TRANSFER_READ,
                        ),
                        image_barrier(
                            images.src,
                            vk::ImageLayout::UNDEFINED,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            vk::AccessFlags::empty(),
                            vk::AccessFlags::TRANSFER_WRITE,
                        ),
                    ],
                );
                self.copy(images.staging_src.image, images.src);
                self.src_layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
            }
            Command::PreComputeBarrier => {
                let src_access = if self.src_layout == vk::ImageLayout::TRANSFER_DST_OPTIMAL {
                    vk::AccessFlags::TRANSFER_WRITE
                } else {
                    vk::AccessFlags::empty()
                };
                self.barrier(
                    vk::PipelineStageFlags::TOP_OF_PIPE | vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    &[
                        image_barrier(
                            images.src,
                            self.src_layout,
                            vk::ImageLayout::GENERAL,
                            src_access,
                            vk::AccessFlags::SHADER_READ,
                        ),
                        image_barrier(
                            images.dst,
                            vk::ImageLayout::UNDEFINED,
                            vk::ImageLayout::GENERAL,
                            vk::AccessFlags::empty(),
                            vk::AccessFlags::SHADER_WRITE,
                        ),
                    ],
                );
                self.src_layout = vk::ImageLayout::GENERAL;
            }
            Command::BindProgram => unsafe {
                // SAFETY: pipeline, layout and set are live; set matches layout.
                self.device
                    .cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::COMPUTE, self.program.pipeline);
                self.device.cmd_bind_descriptor_sets(
                    self.cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    self.program.layout,
                    0,
                    &[self.set],
                    &[],
                );
            },
            Command::Dispatch { x, y, z } => unsafe {
                // SAFETY: a compute pipeline is bound.
                self.device.cmd_dispatch(self.cmd, x, y, z);
            },
            Command::PostComputeBarrier => {
                self.barrier(
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::PipelineStageFlags::TRANSFER,
                    &[
                        image_barrier(
                            images.dst,
                            vk::ImageLayout::GENERAL,
                            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            vk::AccessFlags::SHADER_WRITE,
                            vk::AccessFlags::TRANSFER_READ,
                        ),
                        image_barrier(
                            images.staging_dst.image,
                            vk::ImageLayout::UNDEFINED,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            vk::AccessFlags::empty(),
                            vk::AccessFlags::TRANSFER_WRITE,
                        ),
                    ],
                );
            }
            Command::ReadbackCopy => {
                self.copy(images.dst, images.staging_dst.image);
                // Host reads after the fence; make the copy visible to them.
                self.barrier(
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::HOST,
                    &[image_barrier(
                        images.staging_dst.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::ImageLayout::GENERAL,
                        vk::AccessFlags::TRANSFER_WRITE,
                        vk::AccessFlags::HOST_READ,
                    )],
                );
            }
        }
        Ok(())
    }
}
