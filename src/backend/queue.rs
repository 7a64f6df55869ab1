// Queue submission
//
// Queue is a borrowed vk::Queue plus the device it came from. It owns
// nothing and is never destroyed; the Engine's device outlives it.

use ash::vk;

use super::command::CommandRecorder;
use super::error::{ComputeError, ComputeResult};
use super::result;
use super::sync::{Fence, Semaphore};
use super::validation;

/// One batch of work for `Queue::submit`
#[derive(Clone, Copy, Default)]
pub struct SubmitInfo<'a> {
    pub wait_semaphores: &'a [&'a Semaphore],
    /// One stage mask per wait semaphore
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub command_buffers: &'a [&'a CommandRecorder<'a>],
    pub signal_semaphores: &'a [&'a Semaphore],
}

impl<'a> SubmitInfo<'a> {
    /// Submit `command_buffers` with no semaphores attached
    pub fn new(command_buffers: &'a [&'a CommandRecorder<'a>]) -> Self {
        Self {
            command_buffers,
            ..Default::default()
        }
    }

    pub fn wait_on(
        mut self,
        semaphores: &'a [&'a Semaphore],
        stages: &'a [vk::PipelineStageFlags],
    ) -> Self {
        self.wait_semaphores = semaphores;
        self.wait_stages = stages;
        self
    }

    pub fn signal(mut self, semaphores: &'a [&'a Semaphore]) -> Self {
        self.signal_semaphores = semaphores;
        self
    }
}

struct NativeSubmission {
    wait_semaphores: Vec<vk::Semaphore>,
    command_buffers: Vec<vk::CommandBuffer>,
    signal_semaphores: Vec<vk::Semaphore>,
}

impl From<&SubmitInfo<'_>> for NativeSubmission {
    fn from(submission: &SubmitInfo<'_>) -> Self {
        Self {
            wait_semaphores: submission.wait_semaphores.iter().map(|s| s.native()).collect(),
            command_buffers: submission
                .command_buffers
                .iter()
                .map(|recorder| recorder.native())
                .collect(),
            signal_semaphores: submission.signal_semaphores.iter().map(|s| s.native()).collect(),
        }
    }
}

#[derive(Clone)]
pub struct Queue {
    device: ash::Device,
    queue: vk::Queue,
}

impl Queue {
    /// Fetch queue `queue_index` of `queue_family_index` from `device`
    pub fn new(device: &ash::Device, queue_family_index: u32, queue_index: u32) -> Self {
        let queue = unsafe { device.get_device_queue(queue_family_index, queue_index) };
        Self {
            device: device.clone(),
            queue,
        }
    }

    pub fn native(&self) -> vk::Queue {
        self.queue
    }

    /// Hand `submissions` to the device. `fence` is signaled once all of them finish.
    pub fn submit(&self, submissions: &[SubmitInfo<'_>], fence: &Fence) -> ComputeResult<()> {
        for submission in submissions {
            let counts_match = submission.wait_semaphores.len() == submission.wait_stages.len();
            if !validation::check(counts_match, "Wait semaphores and stage masks differ in count") {
                return Err(ComputeError::Precondition(
                    "Wait semaphores and stage masks differ in count",
                ));
            }
            let semaphores_live = submission
                .wait_semaphores
                .iter()
                .chain(submission.signal_semaphores)
                .all(|semaphore| semaphore.is_initialized());
            if !validation::check(semaphores_live, "Semaphore not initialized") {
                return Err(ComputeError::Precondition("Semaphore not initialized"));
            }
        }

        // Native arrays must stay alive until vkQueueSubmit returns
        let natives: Vec<NativeSubmission> = submissions
            .iter()
            .map(NativeSubmission::from)
            .collect();

        let native_submissions: Vec<vk::SubmitInfo> = submissions
            .iter()
            .zip(&natives)
            .map(|(submission, native)| {
                let mut info = vk::SubmitInfo::builder()
                    .command_buffers(&native.command_buffers)
                    .signal_semaphores(&native.signal_semaphores);
                // the stage mask setter also writes the wait count
                if !native.wait_semaphores.is_empty() {
                    info = info
                        .wait_semaphores(&native.wait_semaphores)
                        .wait_dst_stage_mask(submission.wait_stages);
                }
                info.build()
            })
            .collect();

        result::checked(
            unsafe {
                self.device
                    .queue_submit(self.queue, &native_submissions, fence.native())
            },
            "vkQueueSubmit",
        )
    }

    /// Block until everything submitted to this queue has finished
    pub fn wait_idle(&self) -> ComputeResult<()> {
        result::checked(
            unsafe { self.device.queue_wait_idle(self.queue) },
            "vkQueueWaitIdle",
        )
    }
}
