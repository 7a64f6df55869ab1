// Compute pipeline objects
//
// Descriptor layouts and pools, pipeline layout, pipeline cache and the
// compute pipeline itself. All are static configuration consumed by
// command recording; none of them are touched after creation.

use ash::vk;

use super::buffer::MemoryBuffer;
use super::error::ComputeResult;
use super::result;
use super::shader::ShaderModule;
use super::validation;

// Each wrapper is a device + one handle, destroyed on deinit() or drop.
macro_rules! device_object {
    ($(#[$meta:meta])* $name:ident, $handle:ty, $destroy:ident, $what:literal) => {
        $(#[$meta])*
        pub struct $name {
            device: ash::Device,
            handle: $handle,
        }

        impl $name {
            pub fn deinit(&mut self) {
                validation::check(self.is_initialized(), concat!($what, " not initialized"));
                if self.is_initialized() {
                    unsafe { self.device.$destroy(self.handle, None) };
                    self.handle = <$handle>::null();
                }
            }

            pub fn is_initialized(&self) -> bool {
                self.handle != <$handle>::null()
            }

            pub fn native(&self) -> $handle {
                self.handle
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                if self.is_initialized() {
                    self.deinit();
                }
            }
        }
    };
}

device_object!(
    /// Shape of a descriptor set: which bindings exist and what they hold
    DescriptorSetLayout,
    vk::DescriptorSetLayout,
    destroy_descriptor_set_layout,
    "Descriptor set layout"
);

device_object!(
    /// Pool descriptor sets are allocated from; sets are freed with the pool
    DescriptorPool,
    vk::DescriptorPool,
    destroy_descriptor_pool,
    "Descriptor pool"
);

device_object!(
    PipelineLayout,
    vk::PipelineLayout,
    destroy_pipeline_layout,
    "Pipeline layout"
);

device_object!(
    PipelineCache,
    vk::PipelineCache,
    destroy_pipeline_cache,
    "Pipeline cache"
);

device_object!(
    /// A compute pipeline built from one shader stage
    ComputePipeline,
    vk::Pipeline,
    destroy_pipeline,
    "Pipeline"
);

impl DescriptorSetLayout {
    pub fn new(
        device: &ash::Device,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> ComputeResult<Self> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);

        let handle = result::checked(
            unsafe { device.create_descriptor_set_layout(&create_info, None) },
            "vkCreateDescriptorSetLayout",
        )?;

        Ok(Self {
            device: device.clone(),
            handle,
        })
    }
}

impl DescriptorPool {
    pub fn new(
        device: &ash::Device,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> ComputeResult<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);

        let handle = result::checked(
            unsafe { device.create_descriptor_pool(&create_info, None) },
            "vkCreateDescriptorPool",
        )?;

        Ok(Self {
            device: device.clone(),
            handle,
        })
    }

    /// Allocate one set per layout
    pub fn allocate_descriptor_sets(
        &self,
        layouts: &[&DescriptorSetLayout],
    ) -> ComputeResult<Vec<vk::DescriptorSet>> {
        let native_layouts: Vec<vk::DescriptorSetLayout> =
            layouts.iter().map(|layout| layout.native()).collect();

        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.handle)
            .set_layouts(&native_layouts);

        result::checked(
            unsafe { self.device.allocate_descriptor_sets(&alloc_info) },
            "vkAllocateDescriptorSets",
        )
    }

    /// Point `binding` of `set` at the whole of `buffer` as a storage buffer
    pub fn write_storage_buffer(&self, set: vk::DescriptorSet, binding: u32, buffer: &MemoryBuffer) {
        let buffer_info = vk::DescriptorBufferInfo {
            buffer: buffer.native(),
            offset: 0,
            range: vk::WHOLE_SIZE,
        };

        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(binding)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(std::slice::from_ref(&buffer_info))
            .build();

        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
    }
}

impl PipelineLayout {
    pub fn new(
        device: &ash::Device,
        set_layouts: &[&DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> ComputeResult<Self> {
        let native_layouts: Vec<vk::DescriptorSetLayout> =
            set_layouts.iter().map(|layout| layout.native()).collect();

        let create_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&native_layouts)
            .push_constant_ranges(push_constant_ranges);

        let handle = result::checked(
            unsafe { device.create_pipeline_layout(&create_info, None) },
            "vkCreatePipelineLayout",
        )?;

        Ok(Self {
            device: device.clone(),
            handle,
        })
    }
}

impl PipelineCache {
    /// Create an empty cache
    pub fn new(device: &ash::Device) -> ComputeResult<Self> {
        let create_info = vk::PipelineCacheCreateInfo::builder();

        let handle = result::checked(
            unsafe { device.create_pipeline_cache(&create_info, None) },
            "vkCreatePipelineCache",
        )?;

        Ok(Self {
            device: device.clone(),
            handle,
        })
    }
}

impl ComputePipeline {
    /// Build a compute pipeline from `shader`'s entry point `entry_name`
    pub fn new(
        device: &ash::Device,
        shader: &ShaderModule,
        entry_name: &std::ffi::CStr,
        specialization: Option<&vk::SpecializationInfo>,
        layout: &PipelineLayout,
        cache: &PipelineCache,
    ) -> ComputeResult<Self> {
        let stage = shader
            .stage_create_info(vk::ShaderStageFlags::COMPUTE, entry_name, specialization)?
            .build();

        let create_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(layout.native())
            .build();

        let pipelines = result::checked(
            unsafe {
                device
                    .create_compute_pipelines(cache.native(), &[create_info], None)
                    .map_err(|(_, e)| e)
            },
            "vkCreateComputePipelines",
        )?;

        Ok(Self {
            device: device.clone(),
            handle: pipelines[0],
        })
    }
}
