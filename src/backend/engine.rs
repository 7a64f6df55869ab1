// Vulkan Engine - root of the compute context
//
// Responsibilities:
// - Loader + instance creation, validation layer and debug messenger when enabled
// - Physical device selection (compute-capable, best type, then most memory)
// - Logical device + single compute queue
// - Teardown in reverse creation order
//
// One Engine per process. A second init while one is live is a caller bug.

use ash::{vk, Entry};
use std::cmp::Ordering as CmpOrdering;
use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicBool, Ordering};

use super::error::{ComputeError, ComputeResult};
use super::queue::Queue;
use super::result;
use super::validation;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Engine creation settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub app_name: String,
    /// Enable the Khronos validation layer and debug messenger
    pub validation_layers: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_name: "vkcompute".to_string(),
            validation_layers: cfg!(debug_assertions),
        }
    }
}

/// Two-state process-wide flag: free or taken
pub struct ContextSlot {
    taken: AtomicBool,
}

impl ContextSlot {
    pub const fn new() -> Self {
        Self {
            taken: AtomicBool::new(false),
        }
    }

    /// Take the slot. Returns false if it was already taken.
    pub fn acquire(&self) -> bool {
        !self.taken.swap(true, Ordering::AcqRel)
    }

    pub fn release(&self) {
        self.taken.store(false, Ordering::Release);
    }

    pub fn is_taken(&self) -> bool {
        self.taken.load(Ordering::Acquire)
    }
}

impl Default for ContextSlot {
    fn default() -> Self {
        Self::new()
    }
}

static ENGINE_SLOT: ContextSlot = ContextSlot::new();

// =============================================================================
// DEVICE SCORING
// =============================================================================

/// What selection looks at for one physical device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub device_type: vk::PhysicalDeviceType,
    /// Sum of DEVICE_LOCAL heap sizes
    pub local_memory: vk::DeviceSize,
    /// Sum of all other heap sizes
    pub shared_memory: vk::DeviceSize,
}

impl DeviceCandidate {
    pub fn from_properties(
        properties: &vk::PhysicalDeviceProperties,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
    ) -> Self {
        let (local_memory, shared_memory) = heap_sizes(memory_properties);
        Self {
            device_type: properties.device_type,
            local_memory,
            shared_memory,
        }
    }

    /// Sort key: type rank, then local memory, then shared memory
    pub fn score(&self) -> (u8, vk::DeviceSize, vk::DeviceSize) {
        (device_type_rank(self.device_type), self.local_memory, self.shared_memory)
    }
}

impl PartialOrd for DeviceCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeviceCandidate {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.score().cmp(&other.score())
    }
}

/// DISCRETE > VIRTUAL > INTEGRATED > CPU > anything else
pub fn device_type_rank(device_type: vk::PhysicalDeviceType) -> u8 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 4,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 3,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
        vk::PhysicalDeviceType::CPU => 1,
        _ => 0,
    }
}

/// (device-local, shared) heap totals in bytes
pub fn heap_sizes(memory_properties: &vk::PhysicalDeviceMemoryProperties) -> (u64, u64) {
    let count = (memory_properties.memory_heap_count as usize).min(vk::MAX_MEMORY_HEAPS);
    memory_properties.memory_heaps[..count]
        .iter()
        .fold((0, 0), |(local, shared), heap| {
            if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                (local + heap.size, shared)
            } else {
                (local, shared + heap.size)
            }
        })
}

/// Index of the best candidate, or None if there are none
pub fn select_best_device(candidates: &[DeviceCandidate]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .max_by(|(_, lhs), (_, rhs)| lhs.cmp(rhs))
        .map(|(i, _)| i)
}

/// Whether `name` appears in an instance layer listing
pub fn layer_listed(layers: &[vk::LayerProperties], name: &CStr) -> bool {
    layers.iter().any(|layer| {
        let listed = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
        listed == name
    })
}

/// First queue family with compute support
pub fn find_compute_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .map(|i| i as u32)
}

// =============================================================================
// ENGINE
// =============================================================================

struct DebugMessenger {
    loader: ash::extensions::ext::DebugUtils,
    messenger: vk::DebugUtilsMessengerEXT,
}

// Teardown order is explicit in Engine::deinit, not field order
struct EngineHandles {
    entry: Entry,
    instance: ash::Instance,
    debug: Option<DebugMessenger>,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
    device: ash::Device,
    queue: Queue,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

/// Owns the instance, the chosen physical device, the logical device and its queue
pub struct Engine {
    handles: Option<EngineHandles>,
}

/// What init has created so far, torn down again on failure
#[derive(Default)]
struct PartialInit {
    instance: Option<ash::Instance>,
    debug: Option<DebugMessenger>,
}

impl PartialInit {
    fn rollback(&mut self) {
        unsafe {
            if let Some(debug) = self.debug.take() {
                debug
                    .loader
                    .destroy_debug_utils_messenger(debug.messenger, None);
            }
            if let Some(instance) = self.instance.take() {
                instance.destroy_instance(None);
            }
        }
    }
}

impl Engine {
    /// Create the whole context. On failure everything created so far is destroyed
    /// and another init may be attempted.
    pub fn init(config: &EngineConfig) -> ComputeResult<Self> {
        if !ENGINE_SLOT.acquire() {
            validation::check(false, "Engine already exists");
            return Err(ComputeError::AlreadyInitialized);
        }

        log::info!("Creating compute engine: {}", config.app_name);

        let entry = match unsafe { Entry::load() } {
            Ok(entry) => entry,
            Err(e) => {
                log::error!("Failed to load Vulkan library. Is Vulkan installed? ({})", e);
                ENGINE_SLOT.release();
                return Err(e.into());
            }
        };

        let mut partial = PartialInit::default();
        match Self::create_all(&entry, config, &mut partial) {
            Ok(handles) => Ok(Self {
                handles: Some(handles),
            }),
            Err(e) => {
                log::error!("Engine initialization failed: {}", e);
                partial.rollback();
                ENGINE_SLOT.release();
                Err(e)
            }
        }
    }

    fn create_all(
        entry: &Entry,
        config: &EngineConfig,
        partial: &mut PartialInit,
    ) -> ComputeResult<EngineHandles> {
        let enable_validation =
            config.validation_layers && Self::validation_layer_available(entry);

        let instance = Self::create_instance(entry, &config.app_name, enable_validation)?;
        let instance = partial.instance.insert(instance);

        if enable_validation {
            partial.debug = Some(Self::setup_debug_messenger(entry, instance)?);
        }

        let (physical_device, queue_family_index) = Self::select_physical_device(instance)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        log_device_description(&properties, &memory_properties);

        let device = Self::create_device(instance, physical_device, queue_family_index)?;
        let queue = Queue::new(&device, queue_family_index, 0);

        // Nothing can fail past this point; hand ownership over
        let Some(instance) = partial.instance.take() else {
            unsafe { device.destroy_device(None) };
            return Err(ComputeError::Precondition("Instance missing after creation"));
        };
        let debug = partial.debug.take();

        Ok(EngineHandles {
            entry: entry.clone(),
            instance,
            debug,
            physical_device,
            queue_family_index,
            device,
            queue,
            properties,
            memory_properties,
        })
    }

    fn validation_layer_available(entry: &Entry) -> bool {
        let layers = match entry.enumerate_instance_layer_properties() {
            Ok(layers) => layers,
            Err(e) => {
                log::warn!("Could not enumerate instance layers: {:?}", e);
                return false;
            }
        };

        let found = layer_listed(&layers, VALIDATION_LAYER);
        if !found {
            log::warn!("Validation layer not installed, continuing without it");
        }
        found
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
    ) -> ComputeResult<ash::Instance> {
        let app_name_cstr = CString::new(app_name).unwrap_or_else(|_| c"vkcompute".to_owned());
        let engine_name = c"vkcompute engine";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let (layer_names, extensions) = if enable_validation {
            (
                vec![VALIDATION_LAYER.as_ptr()],
                vec![ash::extensions::ext::DebugUtils::name().as_ptr()],
            )
        } else {
            (vec![], vec![])
        };

        // Chained so that instance creation itself is covered by the callback
        let mut debug_info = debug_messenger_create_info();

        let mut create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);
        if enable_validation {
            create_info = create_info.push_next(&mut debug_info);
        }

        result::checked(
            unsafe { entry.create_instance(&create_info, None) },
            "vkCreateInstance",
        )
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> ComputeResult<DebugMessenger> {
        let loader = ash::extensions::ext::DebugUtils::new(entry, instance);
        let create_info = debug_messenger_create_info();

        let messenger = result::checked(
            unsafe { loader.create_debug_utils_messenger(&create_info, None) },
            "vkCreateDebugUtilsMessengerEXT",
        )?;

        Ok(DebugMessenger { loader, messenger })
    }

    fn select_physical_device(instance: &ash::Instance) -> ComputeResult<(vk::PhysicalDevice, u32)> {
        let devices = result::checked(
            unsafe { instance.enumerate_physical_devices() },
            "vkEnumeratePhysicalDevices",
        )?;

        if devices.is_empty() {
            log::error!("No supported physical devices (such as GPUs)");
            return Err(ComputeError::NoSupportedDevice);
        }
        log::debug!("Found {} physical devices", devices.len());

        // Drop devices without a compute queue, remember the family of the rest
        let supported: Vec<(vk::PhysicalDevice, u32, DeviceCandidate)> = devices
            .into_iter()
            .filter_map(|device| {
                let families =
                    unsafe { instance.get_physical_device_queue_family_properties(device) };
                let family = find_compute_queue_family(&families)?;

                let properties = unsafe { instance.get_physical_device_properties(device) };
                let memory_properties =
                    unsafe { instance.get_physical_device_memory_properties(device) };

                Some((
                    device,
                    family,
                    DeviceCandidate::from_properties(&properties, &memory_properties),
                ))
            })
            .collect();

        let candidates: Vec<DeviceCandidate> =
            supported.iter().map(|&(_, _, candidate)| candidate).collect();

        let Some(best) = select_best_device(&candidates) else {
            log::error!("No supported physical devices (such as GPUs)");
            return Err(ComputeError::NoSupportedDevice);
        };

        let (device, family, _) = supported[best];
        Ok((device, family))
    }

    fn create_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
    ) -> ComputeResult<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities)
            .build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info));

        result::checked(
            unsafe { instance.create_device(physical_device, &create_info, None) },
            "vkCreateDevice",
        )
    }

    /// Destroy device, debug messenger and instance, then unload the loader
    pub fn deinit(&mut self) {
        let Some(handles) = self.handles.take() else {
            validation::check(false, "Engine was not initialized");
            return;
        };

        log::info!("Destroying compute engine...");

        unsafe {
            handles.device.destroy_device(None);
            if let Some(debug) = handles.debug {
                debug
                    .loader
                    .destroy_debug_utils_messenger(debug.messenger, None);
            }
            handles.instance.destroy_instance(None);
        }
        drop(handles.entry);

        ENGINE_SLOT.release();
    }

    pub fn is_initialized(&self) -> bool {
        self.handles.is_some()
    }

    pub fn device(&self) -> &ash::Device {
        &self.live().device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.live().physical_device
    }

    pub fn queue_family_index(&self) -> u32 {
        self.live().queue_family_index
    }

    pub fn queue(&self) -> &Queue {
        &self.live().queue
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.live().properties
    }

    /// Memory types and heaps of the selected physical device
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.live().memory_properties
    }

    /// Name of the selected GPU
    pub fn device_name(&self) -> String {
        unsafe { CStr::from_ptr(self.live().properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    /// Wait for the whole device to go idle (e.g. before cleanup)
    pub fn wait_idle(&self) -> ComputeResult<()> {
        result::checked(
            unsafe { self.live().device.device_wait_idle() },
            "vkDeviceWaitIdle",
        )
    }

    fn live(&self) -> &EngineHandles {
        match &self.handles {
            Some(handles) => handles,
            None => panic!("Engine is not initialized"),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.is_initialized() {
            let _ = self.wait_idle();
            self.deinit();
        }
    }
}

// =============================================================================
// DIAGNOSTICS
// =============================================================================

fn debug_messenger_create_info() -> vk::DebugUtilsMessengerCreateInfoEXT {
    vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
        .build()
}

fn message_type_name(message_type: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "VALIDATION"
    } else if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "PERFORMANCE"
    } else {
        "GENERAL"
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();
    let tag = message_type_name(message_type);

    // No debugger break on errors: stable Rust has no portable breakpoint
    // intrinsic, so validation errors only reach the log.
    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("{{VULKAN:{}}} {}", tag, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("{{VULKAN:{}}} {}", tag, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::debug!("{{VULKAN:{}}} {}", tag, message);
        }
        _ => {
            log::trace!("{{VULKAN:{}}} {}", tag, message);
        }
    }

    vk::FALSE
}

pub fn device_type_name(device_type: vk::PhysicalDeviceType) -> &'static str {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete",
        vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated",
        vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual",
        vk::PhysicalDeviceType::CPU => "CPU",
        _ => "Other / Unknown",
    }
}

pub fn vendor_name(vendor_id: u32) -> &'static str {
    match vendor_id {
        0x10de => "NVIDIA",
        0x8086 => "Intel",
        0x1002 => "AMD",
        0x13b5 => "ARM",
        0x5143 => "Qualcomm",
        _ => "Unknown",
    }
}

/// Driver version as the vendor packs it
pub fn format_driver_version(vendor_id: u32, version: u32) -> String {
    if vendor_id == 0x10de {
        format!(
            "{}.{}.{}.{}",
            (version >> 22) & 0x3ff,
            (version >> 14) & 0x0ff,
            (version >> 6) & 0x0ff,
            version & 0x003f
        )
    } else {
        format!(
            "{}.{}.{} (unformatted: {:#x})",
            vk::api_version_major(version),
            vk::api_version_minor(version),
            vk::api_version_patch(version),
            version
        )
    }
}

fn log_device_description(
    properties: &vk::PhysicalDeviceProperties,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
) {
    let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };

    log::info!("Selected GPU: {}", name.to_string_lossy());
    log::info!("\tGPU Type:       {}", device_type_name(properties.device_type));
    log::info!(
        "\tAPI Version:    {}.{}.{}",
        vk::api_version_major(properties.api_version),
        vk::api_version_minor(properties.api_version),
        vk::api_version_patch(properties.api_version)
    );
    log::info!(
        "\tDriver Version: {}",
        format_driver_version(properties.vendor_id, properties.driver_version)
    );
    log::info!(
        "\tVendor ID:      {:x} ({})",
        properties.vendor_id,
        vendor_name(properties.vendor_id)
    );
    log::info!("\tDevice ID:      {:x}", properties.device_id);

    let count = (memory_properties.memory_heap_count as usize).min(vk::MAX_MEMORY_HEAPS);
    for (i, heap) in memory_properties.memory_heaps[..count].iter().enumerate() {
        let gib = heap.size as f64 / (1024.0 * 1024.0 * 1024.0);
        let kind = if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
            "Local"
        } else {
            "Shared"
        };
        log::info!("\tGPU memory heap [{}] ({}): {:.2} GiB", i, kind, gib);
    }
}
