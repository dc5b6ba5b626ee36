//! Shader module, binding layout and compute pipeline.
//!
//! SPIR-V kernels are used as-is. WGSL kernels are translated with naga
//! (parse, validate, emit SPIR-V) before module creation.

use std::ffi::CString;

use ash::vk;
use naga::back::spv;
use naga::valid::{Capabilities, ValidationFlags, Validator};
use tracing::debug;

use super::VkHandle;
use crate::kernel::{BINDING_LAYOUT, KernelSource};
use crate::ledger::HandleLedger;
use crate::{ComputeError, ComputeResult};

/// Pipeline objects the dispatch needs.
#[derive(Debug, Clone, Copy)]
pub struct Program {
    pub set_layout: vk::DescriptorSetLayout,
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
}

/// SPIR-V words for `kernel`, translating WGSL when needed.
pub fn spirv_words(kernel: &KernelSource, entry_point: &str) -> ComputeResult<Vec<u32>> {
    match kernel {
        KernelSource::SpirV { words, .. } => Ok(words.clone()),
        KernelSource::Text { path, source } => {
            let module = naga::front::wgsl::parse_str(source).map_err(|e| {
                ComputeError::CompileOrLink(format!("{}: {}", path.display(), e.emit_to_string(source)))
            })?;
            let info = Validator::new(ValidationFlags::all(), Capabilities::all())
                .validate(&module)
                .map_err(|e| {
                    ComputeError::CompileOrLink(format!("{}: {}", path.display(), e.emit_to_string(source)))
                })?;
            let pipeline_options = spv::PipelineOptions {
                shader_stage: naga::ShaderStage::Compute,
                entry_point: entry_point.to_string(),
            };
            let words = spv::write_vec(&module, &info, &spv::Options::default(), Some(&pipeline_options))
                .map_err(|e| ComputeError::CompileOrLink(format!("{}: SPIR-V emit failed: {e}", path.display())))?;
            debug!(path = %path.display(), words = words.len(), "WGSL translated to SPIR-V");
            Ok(words)
        }
    }
}

/// Creates the shader module, the 2-slot storage-image layout, the pipeline
/// layout and the compute pipeline, tracking each in creation order.
pub fn create_program(
    device: &ash::Device,
    words: &[u32],
    entry_point: &str,
    ledger: &mut HandleLedger<VkHandle>,
) -> ComputeResult<Program> {
    let module_info = vk::ShaderModuleCreateInfo::default().code(words);
    let module = unsafe {
        // SAFETY: words is a complete SPIR-V module.
        device.create_shader_module(&module_info, None)
    }
    .map_err(|e| ComputeError::CompileOrLink(format!("vkCreateShaderModule failed: {e}")))?;
    ledger.track(VkHandle::ShaderModule(module));

    let bindings: Vec<vk::DescriptorSetLayoutBinding> = BINDING_LAYOUT
        .iter()
        .map(|b| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(b.slot)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
        })
        .collect();
    let set_layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    let set_layout = unsafe {
        // SAFETY: bindings outlive the call.
        device.create_descriptor_set_layout(&set_layout_info, None)
    }
    .map_err(|e| ComputeError::CompileOrLink(format!("vkCreateDescriptorSetLayout failed: {e}")))?;
    ledger.track(VkHandle::DescriptorSetLayout(set_layout));

    let set_layouts = [set_layout];
    let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
    let layout = unsafe {
        // SAFETY: set_layout is live.
        device.create_pipeline_layout(&layout_info, None)
    }
    .map_err(|e| ComputeError::CompileOrLink(format!("vkCreatePipelineLayout failed: {e}")))?;
    ledger.track(VkHandle::PipelineLayout(layout));

    let entry = CString::new(entry_point)
        .map_err(|_| ComputeError::CompileOrLink(format!("invalid entry point name {entry_point:?}")))?;
    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(&entry);
    let pipeline_info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(layout);

    let pipeline = unsafe {
        // SAFETY: module, layout and entry outlive the call.
        device.create_compute_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&pipeline_info), None)
    }
    .map_err(|(_, e)| ComputeError::CompileOrLink(format!("vkCreateComputePipelines failed: {e}")))?
    .into_iter()
    .next()
    .ok_or_else(|| ComputeError::CompileOrLink("vkCreateComputePipelines returned no pipeline".into()))?;
    ledger.track(VkHandle::Pipeline(pipeline));

    debug!(entry_point, bindings = bindings.len(), "compute pipeline created");
    Ok(Program {
        set_layout,
        layout,
        pipeline,
    })
}
