// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface, physical-device pick and logical device.
//!
//! [`DeviceContext`] is created once and shared behind an `Arc` by every
//! RAII child, so it is always the last thing destroyed.

use crate::error::{GpuError, VkResultExt};
use anyhow::{Context, Result};
use ash::ext::debug_utils as ext_debug;
use ash::khr::{surface, swapchain, swapchain_mutable_format};
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::collections::BTreeSet;
use std::ffi::{c_char, CStr};
use tracing::{debug, info, warn};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Device extensions every candidate must expose.
pub const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 2] = [swapchain::NAME, swapchain_mutable_format::NAME];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, one queue is created per entry.
    pub fn unique(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = [self.graphics, self.present].into_iter().collect();
        set.into_iter().collect()
    }
}

/// Pick graphics and present families. A family that does both wins.
pub fn find_queue_families(
    props: &[vk::QueueFamilyProperties],
    mut supports_present: impl FnMut(u32) -> bool,
) -> Result<QueueFamilies, GpuError> {
    let present: Vec<bool> = (0..props.len() as u32).map(&mut supports_present).collect();
    let graphics = |i: usize| {
        props[i].queue_count > 0 && props[i].queue_flags.contains(vk::QueueFlags::GRAPHICS)
    };

    if let Some(i) = (0..props.len()).find(|&i| graphics(i) && present[i]) {
        return Ok(QueueFamilies {
            graphics: i as u32,
            present: i as u32,
        });
    }
    let g = (0..props.len())
        .find(|&i| graphics(i))
        .ok_or(GpuError::MissingQueueFamily("graphics"))?;
    let p = (0..props.len())
        .find(|&i| present[i])
        .ok_or(GpuError::MissingQueueFamily("present"))?;
    Ok(QueueFamilies {
        graphics: g as u32,
        present: p as u32,
    })
}

/// Required names not found in `available`.
pub fn missing_extensions<'a>(available: &[&CStr], required: &[&'a CStr]) -> Vec<&'a CStr> {
    required
        .iter()
        .copied()
        .filter(|r| !available.contains(r))
        .collect()
}

/// Higher is better. Discrete beats integrated beats everything else.
pub fn device_rank(ty: vk::PhysicalDeviceType) -> u32 {
    match ty {
        vk::PhysicalDeviceType::DISCRETE_GPU => 3,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
        _ => 0,
    }
}

fn supports_vulkan_1_3(api_version: u32) -> bool {
    let major = vk::api_version_major(api_version);
    major > 1 || (major == 1 && vk::api_version_minor(api_version) >= 3)
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(target: "vulkan", "[{:?}] {}", types, msg)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(target: "vulkan", "[{:?}] {}", types, msg)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::debug!(target: "vulkan", "[{:?}] {}", types, msg)
        }
        _ => tracing::trace!(target: "vulkan", "[{:?}] {}", types, msg),
    }
    vk::FALSE
}

/// Instance, optional debug messenger and surface. Owned on its own so that a
/// failure between instance creation and device creation still frees them.
pub struct VkInstance {
    pub entry: Entry,
    pub instance: Instance,
    debug: Option<(ext_debug::Instance, vk::DebugUtilsMessengerEXT)>,
    pub surface_loader: surface::Instance,
    /// Null until `create_surface` succeeds.
    pub surface: vk::SurfaceKHR,
}

impl VkInstance {
    unsafe fn new(
        display: raw_window_handle::RawDisplayHandle,
        window: raw_window_handle::RawWindowHandle,
        validation: bool,
    ) -> Result<Self> {
        let mut base = Self::without_surface(display, validation)?;
        base.surface = ash_window::create_surface(&base.entry, &base.instance, display, window, None)
            .check("vkCreateSurfaceKHR")?;
        Ok(base)
    }

    unsafe fn without_surface(
        display: raw_window_handle::RawDisplayHandle,
        validation: bool,
    ) -> Result<Self> {
        let entry = Entry::load().map_err(GpuError::from)?;
        let validation = cfg!(debug_assertions) && validation && has_validation_layer(&entry);
        if cfg!(debug_assertions) && !validation {
            debug!("validation layer disabled or not installed");
        }

        let instance = create_instance(&entry, display, validation).context("create_instance")?;
        let surface_loader = surface::Instance::new(&entry, &instance);
        let mut base = VkInstance {
            entry,
            instance,
            debug: None,
            surface_loader,
            surface: vk::SurfaceKHR::null(),
        };
        if validation {
            base.debug = Some(create_debug_messenger(&base.entry, &base.instance)?);
        }
        Ok(base)
    }
}

impl Drop for VkInstance {
    // surface -> messenger -> instance
    fn drop(&mut self) {
        unsafe {
            if self.surface != vk::SurfaceKHR::null() {
                self.surface_loader.destroy_surface(self.surface, None);
            }
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        debug!("instance destroyed");
    }
}

pub struct DeviceContext {
    pub base: VkInstance,
    pub phys: vk::PhysicalDevice,
    pub device: ash::Device,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub families: QueueFamilies,
    pub swapchain_loader: swapchain::Device,
    pub props: vk::PhysicalDeviceProperties,
    pub mem_props: vk::PhysicalDeviceMemoryProperties,
}

impl DeviceContext {
    /// STRICT ORDER: instance -> surface -> physical device (against that surface) -> device.
    pub unsafe fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        validation: bool,
    ) -> Result<Self> {
        let dh = display.display_handle().map_err(GpuError::from)?.as_raw();
        let wh = window.window_handle().map_err(GpuError::from)?.as_raw();

        // dropped on any error below, taking the surface and instance with it
        let base = VkInstance::new(dh, wh, validation)?;
        let instance = &base.instance;

        let (phys, families) =
            pick_physical_device(instance, &base.surface_loader, base.surface)?;
        let props = instance.get_physical_device_properties(phys);
        let mem_props = instance.get_physical_device_memory_properties(phys);
        info!(
            "GPU: {} ({:?}), api {}.{}.{}, graphics family {}, present family {}",
            props
                .device_name_as_c_str()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            props.device_type,
            vk::api_version_major(props.api_version),
            vk::api_version_minor(props.api_version),
            vk::api_version_patch(props.api_version),
            families.graphics,
            families.present
        );

        let device = create_logical_device(instance, phys, families).context("create_device")?;
        let graphics_queue = device.get_device_queue(families.graphics, 0);
        let present_queue = device.get_device_queue(families.present, 0);
        let swapchain_loader = swapchain::Device::new(instance, &device);

        Ok(DeviceContext {
            base,
            phys,
            device,
            graphics_queue,
            present_queue,
            families,
            swapchain_loader,
            props,
            mem_props,
        })
    }

    pub fn wait_idle(&self) -> Result<(), GpuError> {
        unsafe { self.device.device_wait_idle() }.check("vkDeviceWaitIdle")
    }

    pub fn format_features(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.base
                .instance
                .get_physical_device_format_properties(self.phys, format)
        }
    }

    pub fn max_anisotropy(&self) -> f32 {
        self.props.limits.max_sampler_anisotropy
    }

    pub fn min_uniform_alignment(&self) -> vk::DeviceSize {
        self.props.limits.min_uniform_buffer_offset_alignment
    }
}

impl Drop for DeviceContext {
    // STRICT TEARDOWN ORDER: device here, then `base` drops surface ->
    // messenger -> instance. Every child holding an Arc<DeviceContext> is
    // already gone.
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
        }
        debug!("device destroyed");
    }
}

unsafe fn has_validation_layer(entry: &Entry) -> bool {
    entry
        .enumerate_instance_layer_properties()
        .unwrap_or_default()
        .iter()
        .any(|l| l.layer_name_as_c_str() == Ok(VALIDATION_LAYER))
}

unsafe fn create_instance(
    entry: &Entry,
    display: raw_window_handle::RawDisplayHandle,
    validation: bool,
) -> Result<Instance> {
    let name = c"Lantern";
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: name.as_ptr(),
        application_version: vk::make_api_version(0, 0, 1, 0),
        p_engine_name: name.as_ptr(),
        engine_version: vk::make_api_version(0, 0, 1, 0),
        api_version: vk::API_VERSION_1_3,
        ..Default::default()
    };

    let mut extensions = ash_window::enumerate_required_extensions(display)
        .check("enumerate_required_extensions")?
        .to_vec();
    let layers: Vec<*const c_char> = if validation {
        extensions.push(ext_debug::NAME.as_ptr());
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };
    let instance = entry
        .create_instance(&create_info, None)
        .check("vkCreateInstance")?;
    info!(
        "instance created ({} extensions, validation {})",
        extensions.len(),
        if validation { "on" } else { "off" }
    );
    Ok(instance)
}

unsafe fn create_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> Result<(ext_debug::Instance, vk::DebugUtilsMessengerEXT)> {
    let loader = ext_debug::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    let messenger = loader
        .create_debug_utils_messenger(&ci, None)
        .check("vkCreateDebugUtilsMessengerEXT")?;
    Ok((loader, messenger))
}

/// Suitable: Vulkan 1.3, graphics + present families, required extensions,
/// at least one surface format and present mode, sampler anisotropy.
unsafe fn pick_physical_device(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
    let mut best: Option<(u32, vk::PhysicalDevice, QueueFamilies)> = None;

    for phys in instance
        .enumerate_physical_devices()
        .check("vkEnumeratePhysicalDevices")?
    {
        let props = instance.get_physical_device_properties(phys);
        let name = props
            .device_name_as_c_str()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        if !supports_vulkan_1_3(props.api_version) {
            debug!("skip {name}: Vulkan 1.3 not supported");
            continue;
        }

        let qprops = instance.get_physical_device_queue_family_properties(phys);
        let families = match find_queue_families(&qprops, |i| {
            surface_loader
                .get_physical_device_surface_support(phys, i, surface)
                .unwrap_or(false)
        }) {
            Ok(f) => f,
            Err(e) => {
                debug!("skip {name}: {e}");
                continue;
            }
        };

        let ext_props = instance
            .enumerate_device_extension_properties(phys)
            .check("vkEnumerateDeviceExtensionProperties")?;
        let available: Vec<&CStr> = ext_props
            .iter()
            .filter_map(|e| e.extension_name_as_c_str().ok())
            .collect();
        let missing = missing_extensions(&available, &REQUIRED_DEVICE_EXTENSIONS);
        if !missing.is_empty() {
            debug!("skip {name}: missing {:?}", missing);
            continue;
        }

        let formats = surface_loader
            .get_physical_device_surface_formats(phys, surface)
            .unwrap_or_default();
        let modes = surface_loader
            .get_physical_device_surface_present_modes(phys, surface)
            .unwrap_or_default();
        if formats.is_empty() || modes.is_empty() {
            debug!("skip {name}: no surface formats or present modes");
            continue;
        }

        if instance.get_physical_device_features(phys).sampler_anisotropy != vk::TRUE {
            debug!("skip {name}: no samplerAnisotropy");
            continue;
        }

        let rank = device_rank(props.device_type);
        if best.as_ref().map_or(true, |(r, _, _)| rank > *r) {
            best = Some((rank, phys, families));
        }
    }

    best.map(|(_, phys, families)| (phys, families))
        .ok_or_else(|| GpuError::NoSuitableDevice.into())
}

unsafe fn create_logical_device(
    instance: &Instance,
    phys: vk::PhysicalDevice,
    families: QueueFamilies,
) -> Result<ash::Device> {
    let priorities = [1.0_f32];
    let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .unique()
        .into_iter()
        .map(|family| vk::DeviceQueueCreateInfo {
            s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
            queue_family_index: family,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        })
        .collect();

    // Core 1.3 chain: feats13 <- feats2
    let mut feats13 = vk::PhysicalDeviceVulkan13Features {
        s_type: vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_3_FEATURES,
        dynamic_rendering: vk::TRUE,
        synchronization2: vk::TRUE,
        ..Default::default()
    };
    let feats2 = vk::PhysicalDeviceFeatures2 {
        s_type: vk::StructureType::PHYSICAL_DEVICE_FEATURES_2,
        p_next: (&mut feats13) as *mut _ as *mut _,
        features: vk::PhysicalDeviceFeatures {
            sampler_anisotropy: vk::TRUE,
            ..Default::default()
        },
        ..Default::default()
    };

    let extensions: Vec<*const c_char> = REQUIRED_DEVICE_EXTENSIONS
        .iter()
        .map(|e| e.as_ptr())
        .collect();
    let info = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        p_next: (&feats2 as *const vk::PhysicalDeviceFeatures2) as *const _,
        queue_create_info_count: queue_infos.len() as u32,
        p_queue_create_infos: queue_infos.as_ptr(),
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        ..Default::default()
    };
    let device = instance
        .create_device(phys, &info, None)
        .check("vkCreateDevice")?;
    if !families.is_shared() {
        warn!(
            "graphics ({}) and present ({}) families differ; swapchain images use concurrent sharing",
            families.graphics, families.present
        );
    }
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn combined_family_is_preferred() {
        let props = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        let f = find_queue_families(&props, |i| i != 0).unwrap();
        assert_eq!(f, QueueFamilies { graphics: 2, present: 2 });
        assert!(f.is_shared());
        assert_eq!(f.unique(), vec![2]);
    }

    #[test]
    fn split_families_when_no_family_does_both() {
        let props = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::TRANSFER)];
        let f = find_queue_families(&props, |i| i == 1).unwrap();
        assert_eq!(f, QueueFamilies { graphics: 0, present: 1 });
        assert_eq!(f.unique(), vec![0, 1]);
    }

    #[test]
    fn missing_families_are_named() {
        let compute_only = [family(vk::QueueFlags::COMPUTE)];
        assert!(matches!(
            find_queue_families(&compute_only, |_| true),
            Err(GpuError::MissingQueueFamily("graphics"))
        ));
        let graphics_only = [family(vk::QueueFlags::GRAPHICS)];
        assert!(matches!(
            find_queue_families(&graphics_only, |_| false),
            Err(GpuError::MissingQueueFamily("present"))
        ));
    }

    #[test]
    fn extension_check_reports_only_missing() {
        let available = [c"VK_KHR_swapchain", c"VK_EXT_something"];
        let missing = missing_extensions(&available, &REQUIRED_DEVICE_EXTENSIONS);
        assert_eq!(missing, vec![swapchain_mutable_format::NAME]);
    }

    #[test]
    fn discrete_outranks_integrated() {
        assert!(
            device_rank(vk::PhysicalDeviceType::DISCRETE_GPU)
                > device_rank(vk::PhysicalDeviceType::INTEGRATED_GPU)
        );
        assert!(device_rank(vk::PhysicalDeviceType::INTEGRATED_GPU) > device_rank(vk::PhysicalDeviceType::CPU));
    }

    #[test]
    fn api_version_gate() {
        assert!(supports_vulkan_1_3(vk::API_VERSION_1_3));
        assert!(!supports_vulkan_1_3(vk::API_VERSION_1_2));
    }

    #[test]
    fn instance_without_a_surface_tears_down() {
        let display = raw_window_handle::RawDisplayHandle::Xlib(
            raw_window_handle::XlibDisplayHandle::new(None, 0),
        );
        // needs a Vulkan loader with a driver
        let Ok(base) = (unsafe { VkInstance::without_surface(display, false) }) else {
            return;
        };
        assert_eq!(base.surface, vk::SurfaceKHR::null());
        assert!(base.debug.is_none());
        drop(base);
    }
}
