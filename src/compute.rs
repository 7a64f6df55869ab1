// =============================================================================
// COMPUTE ROUND TRIP
// =============================================================================
//
// host buffer --copy--> device buffer --shader--> device buffer --copy--> host buffer
//
// Recording is split from submission so the barrier protocol can be replayed
// into a CommandLog and checked without a GPU.

use anyhow::{bail, Context, Result};
use ash::vk;
use std::ffi::CStr;
use std::path::Path;

use crate::backend::command::BufferRef;
use crate::backend::{
    CommandPool, CommandRecorder, CommandSink, ComputePipeline, ComputeResult, DescriptorPool,
    DescriptorSetLayout, Engine, Fence, MemoryBuffer, PipelineCache, PipelineLayout,
    ShaderModule, SubmitInfo,
};
use crate::config::ComputeConfig;

const ENTRY_POINT: &CStr = c"main";

/// Invocations per workgroup, handed to the shader as specialization constant 1
pub const WORKGROUP_SIZE: u32 = 64;

/// Workgroups needed to cover `element_count` elements, or None when the
/// count is zero or more than the device's `max_groups` allows
pub fn workgroup_count(element_count: u32, max_groups: u32) -> Option<u32> {
    let groups = element_count.div_ceil(WORKGROUP_SIZE);
    (groups != 0 && groups <= max_groups).then_some(groups)
}

/// Everything the dispatch step binds
#[derive(Debug, Clone, Copy)]
pub struct ComputeDispatch {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptor_set: vk::DescriptorSet,
    pub group_count_x: u32,
}

fn buffer_barrier(
    buffer: vk::Buffer,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::BufferMemoryBarrier {
    vk::BufferMemoryBarrier::builder()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
        .build()
}

/// Stage the input into device memory
pub fn record_upload<S: CommandSink>(
    sink: &mut S,
    host_buffer: BufferRef,
    device_buffer: BufferRef,
) -> ComputeResult<()> {
    sink.copy_buffer(host_buffer, device_buffer)
}

/// Dispatch over `device_buffer`, then copy the result back into `host_buffer`.
///
/// The three barriers are required, in this order:
/// 1. host write -> shader read on the device buffer, before the dispatch
/// 2. shader write -> transfer read on the device buffer, before the copy back
/// 3. transfer write -> host read on the host buffer, before the host maps it
pub fn record_compute_pass<S: CommandSink>(
    sink: &mut S,
    dispatch: &ComputeDispatch,
    device_buffer: BufferRef,
    host_buffer: BufferRef,
) -> ComputeResult<()> {
    sink.pipeline_barrier(
        vk::PipelineStageFlags::HOST,
        vk::PipelineStageFlags::COMPUTE_SHADER,
        vk::DependencyFlags::empty(),
        &[],
        &[buffer_barrier(
            device_buffer.handle,
            vk::AccessFlags::HOST_WRITE,
            vk::AccessFlags::SHADER_READ,
        )],
        &[],
    )?;

    sink.bind_pipeline(dispatch.pipeline, vk::PipelineBindPoint::COMPUTE)?;
    sink.bind_descriptor_sets(
        vk::PipelineBindPoint::COMPUTE,
        dispatch.layout,
        0,
        std::slice::from_ref(&dispatch.descriptor_set),
        &[],
    )?;
    sink.dispatch_x(dispatch.group_count_x)?;

    sink.pipeline_barrier(
        vk::PipelineStageFlags::COMPUTE_SHADER,
        vk::PipelineStageFlags::TRANSFER,
        vk::DependencyFlags::empty(),
        &[],
        &[buffer_barrier(
            device_buffer.handle,
            vk::AccessFlags::SHADER_WRITE,
            vk::AccessFlags::TRANSFER_READ,
        )],
        &[],
    )?;

    sink.copy_buffer(device_buffer, host_buffer)?;

    sink.pipeline_barrier(
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::HOST,
        vk::DependencyFlags::empty(),
        &[],
        &[buffer_barrier(
            host_buffer.handle,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::HOST_READ,
        )],
        &[],
    )?;

    Ok(())
}

/// Run the configured shader over `0..element_count` and return what comes back
pub fn run_round_trip(engine: &Engine, config: &ComputeConfig) -> Result<Vec<u32>> {
    let input: Vec<u32> = (0..config.element_count).collect();
    run_shader(engine, &config.shader_path, &input, config.fence_timeout())
}

/// Objects that live for one round trip, created before anything is submitted
///
/// Fields drop top to bottom: pipeline objects before the buffers they reference.
struct RoundTrip {
    pipeline: ComputePipeline,
    _pipeline_cache: PipelineCache,
    pipeline_layout: PipelineLayout,
    _descriptor_pool: DescriptorPool,
    _descriptor_set_layout: DescriptorSetLayout,
    descriptor_set: vk::DescriptorSet,
    device_buffer: MemoryBuffer,
    host_buffer: MemoryBuffer,
    group_count_x: u32,
}

/// Upload `input`, run the compute shader at `shader_path` over it, read it back.
///
/// The shader sees `input` as a storage buffer at set 0, binding 0, the
/// element count as specialization constant 0 and the workgroup width
/// (`WORKGROUP_SIZE`) as specialization constant 1.
pub fn run_shader(
    engine: &Engine,
    shader_path: &Path,
    input: &[u32],
    fence_timeout: u64,
) -> Result<Vec<u32>> {
    if input.is_empty() {
        bail!("Nothing to process: input is empty");
    }
    let element_count =
        u32::try_from(input.len()).context("Input does not fit in one dispatch")?;
    let max_groups = engine.properties().limits.max_compute_work_group_count[0];
    let Some(group_count_x) = workgroup_count(element_count, max_groups) else {
        bail!(
            "{} elements need more than the device's {} workgroups",
            element_count,
            max_groups
        );
    };

    let device = engine.device();
    let fence = Fence::new(device).context("Failed to create fence")?;
    let command_pool = CommandPool::new(device, engine.queue_family_index())
        .context("Failed to create command pool")?;

    let mut round_trip = RoundTrip::new(engine, shader_path, input, group_count_x)?;

    let mut recorders = command_pool
        .allocate_command_buffers(1, true)
        .context("Failed to allocate command buffer")?;

    let outcome = match recorders.first_mut() {
        Some(recorder) => round_trip.execute(engine, recorder, &fence, fence_timeout),
        None => Err(anyhow::anyhow!("No command buffer was allocated")),
    };

    if outcome.is_err() {
        // Submitted work may still reference the buffers and the command buffer
        if let Err(e) = engine.queue().wait_idle() {
            log::warn!("Queue did not drain after a failed round trip: {}", e);
        }
    }

    for recorder in &mut recorders {
        recorder.deinit();
    }

    outcome
}

impl RoundTrip {
    fn new(engine: &Engine, shader_path: &Path, input: &[u32], group_count_x: u32) -> Result<Self> {
        let element_count = u32::try_from(input.len())?;
        let device = engine.device();
        let memory_properties = engine.memory_properties();
        let byte_size = std::mem::size_of_val(input) as vk::DeviceSize;

        // Staging buffer: host visible but not necessarily coherent, hence the
        // explicit flush here and invalidate on extract
        let mut host_buffer = MemoryBuffer::new(
            device,
            memory_properties,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            byte_size,
        )
        .context("Failed to create host buffer")?;
        host_buffer.write_slice(input)?;
        host_buffer.flush_write()?;

        let device_buffer = MemoryBuffer::new(
            device,
            memory_properties,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            byte_size,
        )
        .context("Failed to create device buffer")?;

        let descriptor_pool = DescriptorPool::new(
            device,
            1,
            &[vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 1,
            }],
        )?;

        let bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .build()];
        let descriptor_set_layout = DescriptorSetLayout::new(device, &bindings)?;

        let descriptor_sets = descriptor_pool.allocate_descriptor_sets(&[&descriptor_set_layout])?;
        let Some(&descriptor_set) = descriptor_sets.first() else {
            bail!("Descriptor pool returned no sets");
        };
        descriptor_pool.write_storage_buffer(descriptor_set, 0, &device_buffer);

        let shader = ShaderModule::from_file(device, shader_path)
            .with_context(|| format!("Failed to load compute shader {:?}", shader_path))?;

        let constants = [element_count, WORKGROUP_SIZE];
        let specialization_entries = [
            vk::SpecializationMapEntry {
                constant_id: 0,
                offset: 0,
                size: std::mem::size_of::<u32>(),
            },
            vk::SpecializationMapEntry {
                constant_id: 1,
                offset: std::mem::size_of::<u32>() as u32,
                size: std::mem::size_of::<u32>(),
            },
        ];
        let specialization = vk::SpecializationInfo::builder()
            .map_entries(&specialization_entries)
            .data(bytemuck::cast_slice(&constants))
            .build();

        let pipeline_layout = PipelineLayout::new(device, &[&descriptor_set_layout], &[])?;
        let pipeline_cache = PipelineCache::new(device)?;
        let pipeline = ComputePipeline::new(
            device,
            &shader,
            ENTRY_POINT,
            Some(&specialization),
            &pipeline_layout,
            &pipeline_cache,
        )
        .context("Failed to create compute pipeline")?;

        log::debug!(
            "Round trip prepared for {} elements in {} workgroups",
            element_count,
            group_count_x
        );

        Ok(Self {
            pipeline,
            _pipeline_cache: pipeline_cache,
            pipeline_layout,
            _descriptor_pool: descriptor_pool,
            _descriptor_set_layout: descriptor_set_layout,
            descriptor_set,
            device_buffer,
            host_buffer,
            group_count_x,
        })
    }

    fn execute(
        &mut self,
        engine: &Engine,
        recorder: &mut CommandRecorder<'_>,
        fence: &Fence,
        fence_timeout: u64,
    ) -> Result<Vec<u32>> {
        let host = BufferRef::from(&self.host_buffer);
        let device = BufferRef::from(&self.device_buffer);

        // Upload
        recorder.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        record_upload(recorder, host, device).context("Failed to record upload")?;
        recorder.end()?;
        submit(engine, recorder, fence)?;
        fence
            .wait_and_reset(fence_timeout)
            .context("Upload did not complete")?;

        // Dispatch and read back
        let dispatch = ComputeDispatch {
            pipeline: self.pipeline.native(),
            layout: self.pipeline_layout.native(),
            descriptor_set: self.descriptor_set,
            group_count_x: self.group_count_x,
        };
        recorder.reset()?;
        recorder.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        record_compute_pass(recorder, &dispatch, device, host)
            .context("Failed to record compute pass")?;
        recorder.end()?;
        submit(engine, recorder, fence)?;
        fence
            .wait_and_reset(fence_timeout)
            .context("Compute pass did not complete")?;

        let output = self.host_buffer.extract_data::<u32>()?;
        engine.queue().wait_idle()?;

        log::info!("Round trip finished: {} elements", output.len());
        Ok(output)
    }
}

fn submit(engine: &Engine, recorder: &CommandRecorder<'_>, fence: &Fence) -> Result<()> {
    let recorders = [recorder];
    engine
        .queue()
        .submit(&[SubmitInfo::new(&recorders)], fence)
        .context("Queue submission failed")
}
