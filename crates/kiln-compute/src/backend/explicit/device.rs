//! Instance, physical device and queue selection.

use std::ffi::CStr;

use ash::vk;
use tracing::debug;

use crate::{ComputeError, ComputeResult};

/// Requested API version. Nothing beyond 1.0 core is used.
pub const API_VERSION: u32 = vk::API_VERSION_1_0;

/// Chosen physical device and its compute queue family.
#[derive(Debug, Clone, Copy)]
pub struct Selection {
    pub physical: vk::PhysicalDevice,
    pub queue_family: u32,
}

/// Loads the Vulkan loader from the system.
pub fn load_entry() -> ComputeResult<ash::Entry> {
    // SAFETY: the loader is kept alive for as long as any instance created
    // from it (the backend stores the entry next to the instance).
    unsafe { ash::Entry::load() }
        .map_err(|e| ComputeError::ResourceAcquisition(format!("cannot load Vulkan loader: {e}")))
}

pub fn create_instance(entry: &ash::Entry) -> ComputeResult<ash::Instance> {
    let app_info = vk::ApplicationInfo::default()
        .application_name(c"kiln")
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"kiln")
        .api_version(API_VERSION);
    let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);

    unsafe {
        // SAFETY: create_info and app_info outlive the call.
        entry.create_instance(&create_info, None)
    }
    .map_err(|e| ComputeError::ResourceAcquisition(format!("vkCreateInstance failed: {e}")))
}

/// First queue family that has at least one queue and the compute bit.
pub fn select_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|f| f.queue_count > 0 && f.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .map(|i| i as u32)
}

/// GPU device types sort before CPU/other so "first GPU" wins when present.
fn type_rank(device_type: vk::PhysicalDeviceType) -> u8 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU
        | vk::PhysicalDeviceType::INTEGRATED_GPU
        | vk::PhysicalDeviceType::VIRTUAL_GPU => 0,
        _ => 1,
    }
}

/// First device (GPUs first, enumeration order otherwise) exposing a
/// compute queue family.
pub fn select_device(instance: &ash::Instance) -> ComputeResult<Selection> {
    let mut devices = unsafe {
        // SAFETY: instance is valid.
        instance.enumerate_physical_devices()
    }
    .map_err(|e| ComputeError::ResourceAcquisition(format!("vkEnumeratePhysicalDevices failed: {e}")))?;

    // Stable sort keeps enumeration order inside each rank.
    devices.sort_by_key(|&pd| {
        // SAFETY: pd was returned by this instance.
        type_rank(unsafe { instance.get_physical_device_properties(pd) }.device_type)
    });

    devices
        .into_iter()
        .find_map(|physical| {
            // SAFETY: physical was returned by this instance.
            let families = unsafe { instance.get_physical_device_queue_family_properties(physical) };
            select_queue_family(&families).map(|queue_family| Selection {
                physical,
                queue_family,
            })
        })
        .ok_or_else(|| ComputeError::ResourceAcquisition("no capable device found".into()))
}

/// Logical device with exactly one compute queue.
pub fn create_device(instance: &ash::Instance, selection: Selection) -> ComputeResult<(ash::Device, vk::Queue)> {
    let priorities = [1.0f32];
    let queue_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(selection.queue_family)
        .queue_priorities(&priorities);
    let create_info = vk::DeviceCreateInfo::default().queue_create_infos(std::slice::from_ref(&queue_info));

    let device = unsafe {
        // SAFETY: physical device belongs to instance; create_info outlives the call.
        instance.create_device(selection.physical, &create_info, None)
    }
    .map_err(|e| ComputeError::ResourceAcquisition(format!("vkCreateDevice failed: {e}")))?;

    // SAFETY: one queue was requested from this family.
    let queue = unsafe { device.get_device_queue(selection.queue_family, 0) };
    debug!(queue_family = selection.queue_family, "logical device created");
    Ok((device, queue))
}

/// Device name and API version string.
pub fn describe(instance: &ash::Instance, physical: vk::PhysicalDevice) -> (String, String) {
    // SAFETY: physical belongs to instance.
    let props = unsafe { instance.get_physical_device_properties(physical) };
    let name = props
        .device_name_as_c_str()
        .map(CStr::to_string_lossy)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| "unknown device".into());
    let v = props.api_version;
    let platform = format!(
        "Vulkan {}.{}.{}",
        vk::api_version_major(v),
        vk::api_version_minor(v),
        vk::api_version_patch(v)
    );
    (name, platform)
}

/// Largest supported 2D image side.
pub fn max_image_dimension(instance: &ash::Instance, physical: vk::PhysicalDevice) -> u32 {
    // SAFETY: physical belongs to instance.
    unsafe { instance.get_physical_device_properties(physical) }
        .limits
        .max_image_dimension2_d
}
