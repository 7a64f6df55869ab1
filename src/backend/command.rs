// Command pools and command recording
//
// A CommandPool hands out CommandRecorders that borrow it, so the pool
// cannot be destroyed while a recorder is alive. Recorders must be given
// back with deinit(); dropping a live one is a caller bug.
//
// Recording goes through the CommandSink trait. CommandRecorder forwards to
// Vulkan, CommandLog keeps a journal, and the same recording code drives both.

use ash::vk;

use super::buffer::MemoryBuffer;
use super::error::{ComputeError, ComputeResult};
use super::result;
use super::validation;

/// Buffer identity as seen by a recording: handle plus byte size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRef {
    pub handle: vk::Buffer,
    pub size: vk::DeviceSize,
}

impl From<&MemoryBuffer> for BufferRef {
    fn from(buffer: &MemoryBuffer) -> Self {
        Self {
            handle: buffer.native(),
            size: buffer.size(),
        }
    }
}

/// The recording surface shared by real command buffers and the journal.
///
/// Every call can fail on a precondition (torn-down recorder, mismatched
/// copy sizes), so a recording stops at the first command that was refused.
pub trait CommandSink {
    /// Full-size copy between two equally sized buffers
    fn copy_buffer(&mut self, src: BufferRef, dst: BufferRef) -> ComputeResult<()>;

    fn pipeline_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        dependency_flags: vk::DependencyFlags,
        memory_barriers: &[vk::MemoryBarrier],
        buffer_barriers: &[vk::BufferMemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    ) -> ComputeResult<()>;

    fn bind_pipeline(
        &mut self,
        pipeline: vk::Pipeline,
        bind_point: vk::PipelineBindPoint,
    ) -> ComputeResult<()>;

    fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) -> ComputeResult<()>;

    fn dispatch(&mut self, count_x: u32, count_y: u32, count_z: u32) -> ComputeResult<()>;

    /// Dispatch over a 1-D grid
    fn dispatch_x(&mut self, count_x: u32) -> ComputeResult<()> {
        self.dispatch(count_x, 1, 1)
    }
}

fn check_copy_sizes(src: BufferRef, dst: BufferRef) -> ComputeResult<()> {
    if validation::check(src.size == dst.size, "Buffers are differing sizes") {
        Ok(())
    } else {
        Err(ComputeError::Precondition("Buffers are differing sizes"))
    }
}

/// Owns a vk::CommandPool bound to one queue family
pub struct CommandPool {
    device: ash::Device,
    pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a pool whose buffers can be reset individually
    pub fn new(device: &ash::Device, queue_family_index: u32) -> ComputeResult<Self> {
        let create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);

        let pool = result::checked(
            unsafe { device.create_command_pool(&create_info, None) },
            "vkCreateCommandPool",
        )?;

        Ok(Self {
            device: device.clone(),
            pool,
        })
    }

    pub fn deinit(&mut self) {
        validation::check(self.is_initialized(), "Command pool not initialized");
        if self.is_initialized() {
            unsafe { self.device.destroy_command_pool(self.pool, None) };
            self.pool = vk::CommandPool::null();
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.pool != vk::CommandPool::null()
    }

    pub fn native(&self) -> vk::CommandPool {
        self.pool
    }

    /// Allocate `count` command buffers in one call
    pub fn allocate_command_buffers(
        &self,
        count: u32,
        is_primary: bool,
    ) -> ComputeResult<Vec<CommandRecorder<'_>>> {
        if !validation::check(count != 0, "Cannot allocate 0 command buffers") {
            return Err(ComputeError::Precondition("Cannot allocate 0 command buffers"));
        }

        let level = if is_primary {
            vk::CommandBufferLevel::PRIMARY
        } else {
            vk::CommandBufferLevel::SECONDARY
        };

        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(level)
            .command_buffer_count(count);

        let buffers = result::checked(
            unsafe { self.device.allocate_command_buffers(&allocate_info) },
            "vkAllocateCommandBuffers",
        )?;

        Ok(buffers
            .into_iter()
            .map(|buffer| CommandRecorder { pool: self, buffer })
            .collect())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        if self.is_initialized() {
            self.deinit();
        }
    }
}

/// One command buffer allocated from a CommandPool
pub struct CommandRecorder<'pool> {
    pool: &'pool CommandPool,
    buffer: vk::CommandBuffer,
}

impl<'pool> CommandRecorder<'pool> {
    /// Free the command buffer back to its pool
    pub fn deinit(&mut self) {
        validation::check(self.is_initialized(), "Command buffer not initialized");
        if self.is_initialized() {
            unsafe {
                self.pool
                    .device
                    .free_command_buffers(self.pool.pool, std::slice::from_ref(&self.buffer))
            };
            self.buffer = vk::CommandBuffer::null();
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.buffer != vk::CommandBuffer::null()
    }

    pub fn native(&self) -> vk::CommandBuffer {
        self.buffer
    }

    pub fn begin(&mut self, flags: vk::CommandBufferUsageFlags) -> ComputeResult<()> {
        self.ensure_initialized()?;
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(flags);
        result::checked(
            unsafe { self.pool.device.begin_command_buffer(self.buffer, &begin_info) },
            "vkBeginCommandBuffer",
        )
    }

    pub fn end(&mut self) -> ComputeResult<()> {
        self.ensure_initialized()?;
        result::checked(
            unsafe { self.pool.device.end_command_buffer(self.buffer) },
            "vkEndCommandBuffer",
        )
    }

    /// Return the buffer to the initial state so it can be recorded again
    pub fn reset(&mut self) -> ComputeResult<()> {
        self.ensure_initialized()?;
        result::checked(
            unsafe {
                self.pool
                    .device
                    .reset_command_buffer(self.buffer, vk::CommandBufferResetFlags::empty())
            },
            "vkResetCommandBuffer",
        )
    }

    fn ensure_initialized(&self) -> ComputeResult<()> {
        if validation::check(self.is_initialized(), "Command buffer not initialized") {
            Ok(())
        } else {
            Err(ComputeError::Precondition("Command buffer not initialized"))
        }
    }
}

impl CommandSink for CommandRecorder<'_> {
    fn copy_buffer(&mut self, src: BufferRef, dst: BufferRef) -> ComputeResult<()> {
        self.ensure_initialized()?;
        check_copy_sizes(src, dst)?;

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: src.size,
        };
        unsafe {
            self.pool
                .device
                .cmd_copy_buffer(self.buffer, src.handle, dst.handle, &[region])
        };
        Ok(())
    }

    fn pipeline_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        dependency_flags: vk::DependencyFlags,
        memory_barriers: &[vk::MemoryBarrier],
        buffer_barriers: &[vk::BufferMemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    ) -> ComputeResult<()> {
        self.ensure_initialized()?;
        unsafe {
            self.pool.device.cmd_pipeline_barrier(
                self.buffer,
                src_stage_mask,
                dst_stage_mask,
                dependency_flags,
                memory_barriers,
                buffer_barriers,
                image_barriers,
            )
        };
        Ok(())
    }

    fn bind_pipeline(
        &mut self,
        pipeline: vk::Pipeline,
        bind_point: vk::PipelineBindPoint,
    ) -> ComputeResult<()> {
        self.ensure_initialized()?;
        unsafe {
            self.pool
                .device
                .cmd_bind_pipeline(self.buffer, bind_point, pipeline)
        };
        Ok(())
    }

    fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) -> ComputeResult<()> {
        self.ensure_initialized()?;
        unsafe {
            self.pool.device.cmd_bind_descriptor_sets(
                self.buffer,
                bind_point,
                layout,
                first_set,
                descriptor_sets,
                dynamic_offsets,
            )
        };
        Ok(())
    }

    fn dispatch(&mut self, count_x: u32, count_y: u32, count_z: u32) -> ComputeResult<()> {
        self.ensure_initialized()?;
        unsafe {
            self.pool
                .device
                .cmd_dispatch(self.buffer, count_x, count_y, count_z)
        };
        Ok(())
    }
}

impl Drop for CommandRecorder<'_> {
    fn drop(&mut self) {
        if !self.is_initialized() {
            return;
        }

        // Don't turn an unwind into an abort
        if !std::thread::panicking() {
            validation::check(false, "Command buffer should have been deinitialized");
        }
        self.deinit();
    }
}

/// A recorded barrier, with only what matters for ordering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierRecord {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    /// (src_access, dst_access, buffer) per buffer barrier
    pub buffer_accesses: Vec<(vk::AccessFlags, vk::AccessFlags, vk::Buffer)>,
    /// (src_access, dst_access) per global memory barrier
    pub memory_accesses: Vec<(vk::AccessFlags, vk::AccessFlags)>,
}

/// Journal entry for one recorded command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCommand {
    CopyBuffer { src: BufferRef, dst: BufferRef },
    Barrier(BarrierRecord),
    BindPipeline { pipeline: vk::Pipeline, bind_point: vk::PipelineBindPoint },
    BindDescriptorSets { layout: vk::PipelineLayout, first_set: u32, count: usize },
    Dispatch { x: u32, y: u32, z: u32 },
}

/// CommandSink that records into memory instead of a command buffer
#[derive(Debug, Default)]
pub struct CommandLog {
    commands: Vec<RecordedCommand>,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    /// Recorded barriers in order, with their position in the journal
    pub fn barriers(&self) -> impl Iterator<Item = (usize, &BarrierRecord)> {
        self.commands
            .iter()
            .enumerate()
            .filter_map(|(i, command)| match command {
                RecordedCommand::Barrier(barrier) => Some((i, barrier)),
                _ => None,
            })
    }
}

impl CommandSink for CommandLog {
    fn copy_buffer(&mut self, src: BufferRef, dst: BufferRef) -> ComputeResult<()> {
        check_copy_sizes(src, dst)?;
        self.commands.push(RecordedCommand::CopyBuffer { src, dst });
        Ok(())
    }

    fn pipeline_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        _dependency_flags: vk::DependencyFlags,
        memory_barriers: &[vk::MemoryBarrier],
        buffer_barriers: &[vk::BufferMemoryBarrier],
        _image_barriers: &[vk::ImageMemoryBarrier],
    ) -> ComputeResult<()> {
        self.commands.push(RecordedCommand::Barrier(BarrierRecord {
            src_stage: src_stage_mask,
            dst_stage: dst_stage_mask,
            buffer_accesses: buffer_barriers
                .iter()
                .map(|b| (b.src_access_mask, b.dst_access_mask, b.buffer))
                .collect(),
            memory_accesses: memory_barriers
                .iter()
                .map(|b| (b.src_access_mask, b.dst_access_mask))
                .collect(),
        }));
        Ok(())
    }

    fn bind_pipeline(
        &mut self,
        pipeline: vk::Pipeline,
        bind_point: vk::PipelineBindPoint,
    ) -> ComputeResult<()> {
        self.commands
            .push(RecordedCommand::BindPipeline { pipeline, bind_point });
        Ok(())
    }

    fn bind_descriptor_sets(
        &mut self,
        _bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
        _dynamic_offsets: &[u32],
    ) -> ComputeResult<()> {
        self.commands.push(RecordedCommand::BindDescriptorSets {
            layout,
            first_set,
            count: descriptor_sets.len(),
        });
        Ok(())
    }

    fn dispatch(&mut self, count_x: u32, count_y: u32, count_z: u32) -> ComputeResult<()> {
        self.commands.push(RecordedCommand::Dispatch {
            x: count_x,
            y: count_y,
            z: count_z,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::validation::{with_policy, ValidationPolicy};
    use ash::vk::Handle;

    fn buffer(raw: u64, size: vk::DeviceSize) -> BufferRef {
        BufferRef {
            handle: vk::Buffer::from_raw(raw),
            size,
        }
    }

    #[test]
    fn journal_keeps_recording_order() {
        let mut log = CommandLog::new();
        log.copy_buffer(buffer(1, 64), buffer(2, 64)).unwrap();
        log.pipeline_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[],
        )
        .unwrap();
        log.dispatch_x(4).unwrap();

        assert!(matches!(log.commands()[0], RecordedCommand::CopyBuffer { .. }));
        assert!(matches!(log.commands()[1], RecordedCommand::Barrier(_)));
        assert_eq!(log.commands()[2], RecordedCommand::Dispatch { x: 4, y: 1, z: 1 });
        assert_eq!(log.barriers().map(|(i, _)| i).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    #[should_panic(expected = "Buffers are differing sizes")]
    fn mismatched_copy_is_fatal() {
        let mut log = CommandLog::new();
        let _ = with_policy(ValidationPolicy::Panic, || {
            log.copy_buffer(buffer(1, 64), buffer(2, 32))
        });
    }

    #[test]
    fn mismatched_copy_is_an_error_under_trust() {
        let mut log = CommandLog::new();
        let result = with_policy(ValidationPolicy::Trust, || {
            log.copy_buffer(buffer(1, 64), buffer(2, 32))
        });
        assert!(matches!(result, Err(ComputeError::Precondition(_))));
        assert!(log.commands().is_empty());
    }
}
