// Synchronization primitives
//
// Fences for GPU -> CPU completion, semaphores for GPU -> GPU ordering
// between submissions. A fence is either unsignaled or signaled; the GPU
// signals it when the submission it was handed to finishes, reset() puts it
// back. Batch calls require every fence to be live and on the same device.

use ash::vk;

use super::error::{ComputeError, ComputeResult};
use super::result;
use super::validation;

/// Timeout value meaning "block until signaled"
pub const WAIT_FOREVER: u64 = u64::MAX;

/// CPU-observable completion signal for queued GPU work
pub struct Fence {
    device: ash::Device,
    fence: vk::Fence,
}

impl Fence {
    /// Create an unsignaled fence
    pub fn new(device: &ash::Device) -> ComputeResult<Self> {
        Self::create(device, vk::FenceCreateFlags::empty())
    }

    /// Create a fence that starts signaled, so the first wait returns immediately
    pub fn new_signaled(device: &ash::Device) -> ComputeResult<Self> {
        Self::create(device, vk::FenceCreateFlags::SIGNALED)
    }

    fn create(device: &ash::Device, flags: vk::FenceCreateFlags) -> ComputeResult<Self> {
        let create_info = vk::FenceCreateInfo::builder().flags(flags);

        let fence = result::checked(
            unsafe { device.create_fence(&create_info, None) },
            "vkCreateFence",
        )?;

        Ok(Self {
            device: device.clone(),
            fence,
        })
    }

    pub fn deinit(&mut self) {
        validation::check(self.is_initialized(), "Fence not initialized");
        if self.is_initialized() {
            unsafe { self.device.destroy_fence(self.fence, None) };
            self.fence = vk::Fence::null();
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.fence != vk::Fence::null()
    }

    pub fn native(&self) -> vk::Fence {
        self.fence
    }

    /// Native handle of the device this fence was created on
    pub fn device_handle(&self) -> vk::Device {
        self.device.handle()
    }

    /// Block until signaled. `timeout` is in nanoseconds and advisory; the driver may wait longer.
    pub fn wait(&self, timeout: u64) -> ComputeResult<()> {
        self.ensure_initialized()?;
        result::checked(
            unsafe { self.device.wait_for_fences(&[self.fence], true, timeout) },
            "vkWaitForFences",
        )
    }

    pub fn wait_and_reset(&self, timeout: u64) -> ComputeResult<()> {
        self.wait(timeout)?;
        self.reset()
    }

    pub fn reset(&self) -> ComputeResult<()> {
        self.ensure_initialized()?;
        result::checked(
            unsafe { self.device.reset_fences(&[self.fence]) },
            "vkResetFences",
        )
    }

    /// Poll without blocking
    pub fn is_signaled(&self) -> ComputeResult<bool> {
        self.ensure_initialized()?;
        // ash folds SUCCESS / NOT_READY into Ok(bool)
        result::checked(
            unsafe { self.device.get_fence_status(self.fence) },
            "vkGetFenceStatus",
        )
    }

    /// Block until every fence in the batch is signaled
    pub fn wait_all(fences: &[Fence], timeout: u64) -> ComputeResult<()> {
        Self::multi_wait(fences, true, timeout, false)
    }

    /// Block until at least one fence in the batch is signaled
    pub fn wait_one(fences: &[Fence], timeout: u64) -> ComputeResult<()> {
        Self::multi_wait(fences, false, timeout, false)
    }

    pub fn wait_all_and_reset(fences: &[Fence], timeout: u64) -> ComputeResult<()> {
        Self::multi_wait(fences, true, timeout, true)
    }

    /// Waits for at least one, then resets the whole batch
    pub fn wait_one_and_reset(fences: &[Fence], timeout: u64) -> ComputeResult<()> {
        Self::multi_wait(fences, false, timeout, true)
    }

    pub fn reset_all(fences: &[Fence]) -> ComputeResult<()> {
        let device = Self::batch_device(fences)?;
        let native_fences: Vec<vk::Fence> = fences.iter().map(Fence::native).collect();

        result::checked(
            unsafe { device.reset_fences(&native_fences) },
            "vkResetFences",
        )
    }

    fn multi_wait(
        fences: &[Fence],
        wait_all: bool,
        timeout: u64,
        should_reset: bool,
    ) -> ComputeResult<()> {
        let device = Self::batch_device(fences)?;
        let native_fences: Vec<vk::Fence> = fences.iter().map(Fence::native).collect();

        result::checked(
            unsafe { device.wait_for_fences(&native_fences, wait_all, timeout) },
            "vkWaitForFences",
        )?;

        if should_reset {
            result::checked(
                unsafe { device.reset_fences(&native_fences) },
                "vkResetFences",
            )?;
        }

        Ok(())
    }

    /// Validate a batch and pick the device every native call will go through
    fn batch_device(fences: &[Fence]) -> ComputeResult<&ash::Device> {
        let entries: Vec<(vk::Fence, vk::Device)> = fences
            .iter()
            .map(|fence| (fence.native(), fence.device_handle()))
            .collect();

        check_batch_compatible(&entries)?;
        Ok(&fences[0].device)
    }

    fn ensure_initialized(&self) -> ComputeResult<()> {
        if validation::check(self.is_initialized(), "Fence not initialized") {
            Ok(())
        } else {
            Err(ComputeError::Precondition("Fence not initialized"))
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        if self.is_initialized() {
            self.deinit();
        }
    }
}

/// Batch preconditions, checked on raw (fence, device) pairs before any native call
pub(crate) fn check_batch_compatible(entries: &[(vk::Fence, vk::Device)]) -> ComputeResult<()> {
    let Some(&(_, device)) = entries.first() else {
        validation::check(false, "Requires at least one fence");
        return Err(ComputeError::Precondition("Requires at least one fence"));
    };

    // Works either way, but the single-fence methods exist for this
    validation::check(entries.len() != 1, "For 1 fence, use the non-static method instead");

    for &(fence, fence_device) in entries {
        if !validation::check(fence != vk::Fence::null(), "All fences must be initialized") {
            return Err(ComputeError::Precondition("All fences must be initialized"));
        }
        if !validation::check(fence_device == device, "All fences must have the same device") {
            return Err(ComputeError::Precondition("All fences must have the same device"));
        }
    }

    Ok(())
}

/// GPU-side ordering between submissions
pub struct Semaphore {
    device: ash::Device,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    pub fn new(device: &ash::Device) -> ComputeResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();

        let semaphore = result::checked(
            unsafe { device.create_semaphore(&create_info, None) },
            "vkCreateSemaphore",
        )?;

        Ok(Self {
            device: device.clone(),
            semaphore,
        })
    }

    pub fn deinit(&mut self) {
        validation::check(self.is_initialized(), "Semaphore not initialized");
        if self.is_initialized() {
            unsafe { self.device.destroy_semaphore(self.semaphore, None) };
            self.semaphore = vk::Semaphore::null();
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.semaphore != vk::Semaphore::null()
    }

    pub fn native(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if self.is_initialized() {
            self.deinit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::validation::{with_policy, ValidationPolicy};
    use ash::vk::Handle;

    fn entry(fence: u64, device: u64) -> (vk::Fence, vk::Device) {
        (vk::Fence::from_raw(fence), vk::Device::from_raw(device))
    }

    #[test]
    fn homogeneous_batch_passes() {
        let batch = [entry(1, 10), entry(2, 10), entry(3, 10)];
        assert!(with_policy(ValidationPolicy::Panic, || check_batch_compatible(&batch)).is_ok());
    }

    #[test]
    #[should_panic(expected = "Requires at least one fence")]
    fn empty_batch_is_fatal() {
        let _ = with_policy(ValidationPolicy::Panic, || check_batch_compatible(&[]));
    }

    #[test]
    #[should_panic(expected = "All fences must have the same device")]
    fn mixed_devices_are_fatal() {
        let batch = [entry(1, 10), entry(2, 20)];
        let _ = with_policy(ValidationPolicy::Panic, || check_batch_compatible(&batch));
    }

    #[test]
    #[should_panic(expected = "All fences must be initialized")]
    fn torn_down_fence_is_fatal() {
        let batch = [entry(1, 10), entry(0, 10)];
        let _ = with_policy(ValidationPolicy::Panic, || check_batch_compatible(&batch));
    }

    #[test]
    #[should_panic(expected = "use the non-static method")]
    fn single_fence_batch_is_flagged() {
        let _ = with_policy(ValidationPolicy::Panic, || check_batch_compatible(&[entry(1, 10)]));
    }

    #[test]
    fn trust_policy_rejects_bad_batches_without_panicking() {
        with_policy(ValidationPolicy::Trust, || {
            assert!(matches!(
                check_batch_compatible(&[]),
                Err(ComputeError::Precondition(_))
            ));
            assert!(matches!(
                check_batch_compatible(&[entry(1, 10), entry(2, 20)]),
                Err(ComputeError::Precondition(_))
            ));
            // a lone fence is only misuse, the call still goes through
            assert!(check_batch_compatible(&[entry(1, 10)]).is_ok());
        });
    }
}
