//! Device images, staging mirrors and memory-type matching.
//!
//! Four images per session:
//!
//! | image       | tiling  | memory                        | usage                 |
//! |-------------|---------|-------------------------------|-----------------------|
//! | source      | optimal | DEVICE_LOCAL                  | STORAGE, TRANSFER_DST |
//! | destination | optimal | DEVICE_LOCAL                  | STORAGE, TRANSFER_SRC |
//! | staging src | linear  | HOST_VISIBLE \| HOST_COHERENT | TRANSFER_SRC          |
//! | staging dst | linear  | HOST_VISIBLE \| HOST_COHERENT | TRANSFER_DST          |
//!
//! Format support for each tiling and usage pair is checked before any
//! image is created. Memory requirements are queried from each image's own
//! handle.

use ash::vk;
use kiln_core::{Extent, RGBA_CHANNELS};
use tracing::debug;

use super::VkHandle;
use crate::ledger::HandleLedger;
use crate::{ComputeError, ComputeResult};

/// Device texel format.
pub const FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

const TEXEL_BYTES: usize = RGBA_CHANNELS as usize * std::mem::size_of::<f32>();

pub const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

pub const COLOR_LAYERS: vk::ImageSubresourceLayers = vk::ImageSubresourceLayers {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    mip_level: 0,
    base_array_layer: 0,
    layer_count: 1,
};

/// Lowest-indexed memory type allowed by `type_bits` whose flags are a
/// superset of `required`.
pub fn select_memory_type(
    types: &[vk::MemoryType],
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> ComputeResult<u32> {
    types
        .iter()
        .take(32)
        .enumerate()
        .find(|(i, t)| type_bits & (1u32 << i) != 0 && t.property_flags.contains(required))
        .map(|(i, _)| i as u32)
        .ok_or_else(|| {
            ComputeError::MemoryAllocation(format!(
                "no memory type with bits={type_bits:#x} flags={required:?}"
            ))
        })
}

/// Host-visible linear image used as a copy hop.
#[derive(Debug, Clone, Copy)]
pub struct StagingImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub coherent: bool,
    pub layout: vk::SubresourceLayout,
}

/// The session's four images.
#[derive(Debug, Clone, Copy)]
pub struct ImageSet {
    pub extent: Extent,
    pub src: vk::Image,
    pub dst: vk::Image,
    pub src_view: vk::ImageView,
    pub dst_view: vk::ImageView,
    pub staging_src: StagingImage,
    pub staging_dst: StagingImage,
}

struct ImageSpec {
    tiling: vk::ImageTiling,
    usage: vk::ImageUsageFlags,
    initial_layout: vk::ImageLayout,
    memory: vk::MemoryPropertyFlags,
}

const DEVICE_SRC: ImageSpec = ImageSpec {
    tiling: vk::ImageTiling::OPTIMAL,
    usage: vk::ImageUsageFlags::from_raw(
        vk::ImageUsageFlags::STORAGE.as_raw() | vk::ImageUsageFlags::TRANSFER_DST.as_raw(),
    ),
    initial_layout: vk::ImageLayout::UNDEFINED,
    memory: vk::MemoryPropertyFlags::DEVICE_LOCAL,
};

const DEVICE_DST: ImageSpec = ImageSpec {
    tiling: vk::ImageTiling::OPTIMAL,
    usage: vk::ImageUsageFlags::from_raw(
        vk::ImageUsageFlags::STORAGE.as_raw() | vk::ImageUsageFlags::TRANSFER_SRC.as_raw(),
    ),
    initial_layout: vk::ImageLayout::UNDEFINED,
    memory: vk::MemoryPropertyFlags::DEVICE_LOCAL,
};

const HOST_VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

// Preinitialized keeps the host writes made before the first transition.
const STAGING_SRC: ImageSpec = ImageSpec {
    tiling: vk::ImageTiling::LINEAR,
    usage: vk::ImageUsageFlags::TRANSFER_SRC,
    initial_layout: vk::ImageLayout::PREINITIALIZED,
    memory: HOST_VISIBLE,
};

const STAGING_DST: ImageSpec = ImageSpec {
    tiling: vk::ImageTiling::LINEAR,
    usage: vk::ImageUsageFlags::TRANSFER_DST,
    initial_layout: vk::ImageLayout::UNDEFINED,
    memory: HOST_VISIBLE,
};

/// Rejects an extent the format query does not allow. `ERROR_FORMAT_NOT_SUPPORTED`
/// means the tiling and usage pair is unavailable on this device.
fn check_format_support(
    queried: ash::prelude::VkResult<vk::ImageFormatProperties>,
    extent: Extent,
    tiling: vk::ImageTiling,
) -> ComputeResult<()> {
    let props = queried.map_err(|e| match e {
        vk::Result::ERROR_FORMAT_NOT_SUPPORTED => {
            ComputeError::MemoryAllocation(format!("{FORMAT:?} with {tiling:?} tiling is not supported"))
        }
        e => ComputeError::MemoryAllocation(format!("vkGetPhysicalDeviceImageFormatProperties failed: {e}")),
    })?;
    if extent.width > props.max_extent.width || extent.height > props.max_extent.height {
        return Err(ComputeError::MemoryAllocation(format!(
            "{extent} exceeds {}x{} for {FORMAT:?} with {tiling:?} tiling",
            props.max_extent.width, props.max_extent.height
        )));
    }
    Ok(())
}

fn query_format_support(
    instance: &ash::Instance,
    physical: vk::PhysicalDevice,
    extent: Extent,
    spec: &ImageSpec,
) -> ComputeResult<()> {
    let queried = unsafe {
        // SAFETY: physical was enumerated from instance.
        instance.get_physical_device_image_format_properties(
            physical,
            FORMAT,
            vk::ImageType::TYPE_2D,
            spec.tiling,
            spec.usage,
            vk::ImageCreateFlags::empty(),
        )
    };
    check_format_support(queried, extent, spec.tiling)
}

fn create_image(
    device: &ash::Device,
    extent: Extent,
    spec: &ImageSpec,
    ledger: &mut HandleLedger<VkHandle>,
) -> ComputeResult<vk::Image> {
    let info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(FORMAT)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(spec.tiling)
        .usage(spec.usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(spec.initial_layout);

    let image = unsafe {
        // SAFETY: device is valid and info outlives the call.
        device.create_image(&info, None)
    }
    .map_err(|e| ComputeError::MemoryAllocation(format!("vkCreateImage failed: {e}")))?;
    ledger.track(VkHandle::Image(image));
    Ok(image)
}

/// Allocates and binds memory for `image`. Returns the memory and whether
/// the chosen type is host-coherent.
fn bind_memory(
    device: &ash::Device,
    types: &[vk::MemoryType],
    image: vk::Image,
    required: vk::MemoryPropertyFlags,
    ledger: &mut HandleLedger<VkHandle>,
) -> ComputeResult<(vk::DeviceMemory, bool)> {
    // SAFETY: image was created from device.
    let requirements = unsafe { device.get_image_memory_requirements(image) };
    let index = select_memory_type(types, requirements.memory_type_bits, required)?;

    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(index);
    let memory = unsafe {
        // SAFETY: index is a valid memory type of this device.
        device.allocate_memory(&alloc_info, None)
    }
    .map_err(|e| ComputeError::MemoryAllocation(format!("vkAllocateMemory failed: {e}")))?;
    ledger.track(VkHandle::Memory(memory));

    unsafe {
        // SAFETY: memory was sized from this image's own requirements.
        device.bind_image_memory(image, memory, 0)
    }
    .map_err(|e| ComputeError::MemoryAllocation(format!("vkBindImageMemory failed: {e}")))?;

    let coherent = types[index as usize]
        .property_flags
        .contains(vk::MemoryPropertyFlags::HOST_COHERENT);
    debug!(?image, memory_type = index, size = requirements.size, coherent, "image memory bound");
    Ok((memory, coherent))
}

fn create_view(
    device: &ash::Device,
    image: vk::Image,
    ledger: &mut HandleLedger<VkHandle>,
) -> ComputeResult<vk::ImageView> {
    let info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(FORMAT)
        .subresource_range(COLOR_RANGE);
    let view = unsafe {
        // SAFETY: image is bound to memory and outlives the view.
        device.create_image_view(&info, None)
    }
    .map_err(|e| ComputeError::MemoryAllocation(format!("vkCreateImageView failed: {e}")))?;
    ledger.track(VkHandle::ImageView(view));
    Ok(view)
}

/// Creates images, then memory, then views, so teardown releases views,
/// memory and images in that order.
pub fn create_image_set(
    instance: &ash::Instance,
    physical: vk::PhysicalDevice,
    device: &ash::Device,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    extent: Extent,
    ledger: &mut HandleLedger<VkHandle>,
) -> ComputeResult<ImageSet> {
    let types = &memory_properties.memory_types[..memory_properties.memory_type_count as usize];
    for spec in [&DEVICE_SRC, &DEVICE_DST, &STAGING_SRC, &STAGING_DST] {
        query_format_support(instance, physical, extent, spec)?;
    }

    let src = create_image(device, extent, &DEVICE_SRC, ledger)?;
    let dst = create_image(device, extent, &DEVICE_DST, ledger)?;
    let staging_src = create_image(device, extent, &STAGING_SRC, ledger)?;
    let staging_dst = create_image(device, extent, &STAGING_DST, ledger)?;

    bind_memory(device, types, src, DEVICE_SRC.memory, ledger)?;
    bind_memory(device, types, dst, DEVICE_DST.memory, ledger)?;
    let (staging_src_memory, staging_src_coherent) =
        bind_memory(device, types, staging_src, STAGING_SRC.memory, ledger)?;
    let (staging_dst_memory, staging_dst_coherent) =
        bind_memory(device, types, staging_dst, STAGING_DST.memory, ledger)?;

    let src_view = create_view(device, src, ledger)?;
    let dst_view = create_view(device, dst, ledger)?;

    Ok(ImageSet {
        extent,
        src,
        dst,
        src_view,
        dst_view,
        staging_src: StagingImage {
            image: staging_src,
            memory: staging_src_memory,
            coherent: staging_src_coherent,
            layout: subresource_layout(device, staging_src),
        },
        staging_dst: StagingImage {
            image: staging_dst,
            memory: staging_dst_memory,
            coherent: staging_dst_coherent,
            layout: subresource_layout(device, staging_dst),
        },
    })
}

fn subresource_layout(device: &ash::Device, image: vk::Image) -> vk::SubresourceLayout {
    let subresource = vk::ImageSubresource {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        array_layer: 0,
    };
    // SAFETY: image is a linear image created from device.
    unsafe { device.get_image_subresource_layout(image, subresource) }
}

/// Row geometry of a linear image's first subresource inside its mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowPitch {
    pub offset: usize,
    pub row_pitch: usize,
    pub row_bytes: usize,
}

impl RowPitch {
    pub fn new(layout: &vk::SubresourceLayout, extent: Extent) -> Self {
        Self {
            offset: layout.offset as usize,
            row_pitch: layout.row_pitch as usize,
            row_bytes: extent.width as usize * TEXEL_BYTES,
        }
    }

    /// Bytes from the start of the mapping to the end of the last row.
    pub fn span(&self, rows: usize) -> usize {
        match rows {
            0 => self.offset,
            n => self.offset + (n - 1) * self.row_pitch + self.row_bytes,
        }
    }

    fn check(&self, tight_len: usize, pitched_len: usize) -> Result<usize, String> {
        if self.row_bytes == 0 || tight_len % self.row_bytes != 0 {
            return Err(format!("{tight_len} bytes is not a whole number of {}-byte rows", self.row_bytes));
        }
        let rows = tight_len / self.row_bytes;
        if rows > 1 && self.row_pitch < self.row_bytes {
            return Err(format!("row pitch {} is shorter than a {}-byte row", self.row_pitch, self.row_bytes));
        }
        if self.span(rows) > pitched_len {
            return Err(format!("{rows} rows need {} bytes, mapping has {pitched_len}", self.span(rows)));
        }
        Ok(rows)
    }

    /// Copies tightly packed rows into `pitched` at this pitch.
    pub fn pack(&self, tight: &[u8], pitched: &mut [u8]) -> ComputeResult<()> {
        self.check(tight.len(), pitched.len()).map_err(ComputeError::MemoryAllocation)?;
        for (y, row) in tight.chunks_exact(self.row_bytes).enumerate() {
            let start = self.offset + y * self.row_pitch;
            pitched[start..start + self.row_bytes].copy_from_slice(row);
        }
        Ok(())
    }

    /// Copies rows at this pitch out of `pitched` into tightly packed `tight`.
    pub fn unpack(&self, pitched: &[u8], tight: &mut [u8]) -> ComputeResult<()> {
        self.check(tight.len(), pitched.len()).map_err(ComputeError::Validation)?;
        for (y, row) in tight.chunks_exact_mut(self.row_bytes).enumerate() {
            let start = self.offset + y * self.row_pitch;
            row.copy_from_slice(&pitched[start..start + self.row_bytes]);
        }
        Ok(())
    }
}

fn mapped_range(memory: vk::DeviceMemory) -> vk::MappedMemoryRange<'static> {
    vk::MappedMemoryRange::default()
        .memory(memory)
        .offset(0)
        .size(vk::WHOLE_SIZE)
}

/// Copies RGBA texels into the staging source, one row at a time at the
/// image's row pitch.
pub fn write_staging(device: &ash::Device, staging: &StagingImage, extent: Extent, rgba: &[f32]) -> ComputeResult<()> {
    let bytes: &[u8] = bytemuck::cast_slice(rgba);
    if bytes.len() != extent.pixel_count() * TEXEL_BYTES {
        return Err(ComputeError::MemoryAllocation(format!(
            "upload of {} bytes does not match {extent} RGBA32F",
            bytes.len()
        )));
    }

    let rows = RowPitch::new(&staging.layout, extent);
    let mapped_len = staging.layout.offset as usize + staging.layout.size as usize;
    let ptr = unsafe {
        // SAFETY: memory is host-visible and not currently mapped.
        device.map_memory(staging.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
    }
    .map_err(|e| ComputeError::MemoryAllocation(format!("vkMapMemory failed: {e}")))?
    .cast::<u8>();
    // SAFETY: the mapping covers the whole allocation, which holds the
    // subresource at offset..offset + size.
    let pitched = unsafe { std::slice::from_raw_parts_mut(ptr, mapped_len) };
    let packed = rows.pack(bytes, pitched);
    if packed.is_err() {
        // SAFETY: memory is mapped and pitched is not used past this point.
        unsafe { device.unmap_memory(staging.memory) };
        return packed;
    }

    let flushed = if staging.coherent {
        Ok(())
    } else {
        unsafe {
            // SAFETY: memory is mapped.
            device.flush_mapped_memory_ranges(&[mapped_range(staging.memory)])
        }
    };
    // SAFETY: memory is mapped and no pointer into it is used past this point.
    unsafe { device.unmap_memory(staging.memory) };
    flushed.map_err(|e| ComputeError::MemoryAllocation(format!("vkFlushMappedMemoryRanges failed: {e}")))
}

/// Reads RGBA texels from the staging destination.
pub fn read_staging(device: &ash::Device, staging: &StagingImage, extent: Extent) -> ComputeResult<Vec<f32>> {
    let rows = RowPitch::new(&staging.layout, extent);
    let mapped_len = staging.layout.offset as usize + staging.layout.size as usize;
    let mut out = vec![0.0f32; extent.pixel_count() * RGBA_CHANNELS as usize];

    let ptr = unsafe {
        // SAFETY: memory is host-visible and not currently mapped.
        device.map_memory(staging.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
    }
    .map_err(|e| ComputeError::Synchronization(format!("vkMapMemory failed: {e}")))?
    .cast::<u8>();

    if !staging.coherent {
        let invalidated = unsafe {
            // SAFETY: memory is mapped.
            device.invalidate_mapped_memory_ranges(&[mapped_range(staging.memory)])
        };
        if let Err(e) = invalidated {
            // SAFETY: memory is mapped.
            unsafe { device.unmap_memory(staging.memory) };
            return Err(ComputeError::Synchronization(format!(
                "vkInvalidateMappedMemoryRanges failed: {e}"
            )));
        }
    }

    // SAFETY: same mapping bounds as in write_staging.
    let pitched = unsafe { std::slice::from_raw_parts(ptr.cast_const(), mapped_len) };
    let unpacked = rows.unpack(pitched, bytemuck::cast_slice_mut(&mut out));

    // SAFETY: memory is mapped and pitched is not used past this point.
    unsafe { device.unmap_memory(staging.memory) };
    unpacked.map(|()| out)
}
