// GPU memory buffers
//
// A MemoryBuffer is one vk::Buffer plus the one vk::DeviceMemory backing it.
// They are created and destroyed together; there is no sub-allocation.

use ash::vk;
use bytemuck::Pod;

use super::error::{ComputeError, ComputeResult};
use super::result;
use super::validation;

/// Find the first memory type allowed by `type_bits` whose flags contain `required`.
///
/// Bits are walked from the least significant end, so the lowest compatible
/// index wins. Drivers order their types so that this is usually the cheapest.
pub fn find_memory_type_index(
    type_bits: u32,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32)).find(|&i| {
        let allowed = type_bits & (1 << i) != 0;
        allowed
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(required)
    })
}

/// A buffer and its dedicated memory allocation
pub struct MemoryBuffer {
    device: ash::Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
}

impl MemoryBuffer {
    /// Create a buffer of `size` bytes and bind it to freshly allocated memory
    ///
    /// # Arguments
    /// * `memory_properties` - memory types of the physical device the device was created from
    /// * `memory_flags` - properties the chosen memory type must have (e.g. HOST_VISIBLE)
    pub fn new(
        device: &ash::Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
        size: vk::DeviceSize,
    ) -> ComputeResult<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = result::checked(
            unsafe { device.create_buffer(&buffer_info, None) },
            "vkCreateBuffer",
        )?;

        let mem_requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let Some(memory_type_index) =
            find_memory_type_index(mem_requirements.memory_type_bits, memory_properties, memory_flags)
        else {
            log::error!(
                "No memory type with {:?} in mask {:#b}",
                memory_flags,
                mem_requirements.memory_type_bits
            );
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(ComputeError::NoCompatibleMemoryType);
        };

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match result::checked(
            unsafe { device.allocate_memory(&alloc_info, None) },
            "vkAllocateMemory",
        ) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = result::checked(
            unsafe { device.bind_buffer_memory(buffer, memory, 0) },
            "vkBindBufferMemory",
        ) {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(e);
        }

        log::debug!(
            "Allocated {} byte buffer in memory type {} ({:?})",
            size,
            memory_type_index,
            memory_properties.memory_types[memory_type_index as usize].property_flags
        );

        Ok(Self {
            device: device.clone(),
            buffer,
            memory,
            size,
        })
    }

    /// Destroy the buffer and free its memory. Leaves an empty handle behind.
    pub fn deinit(&mut self) {
        validation::check(self.is_initialized(), "Buffer not initialized");
        if !self.is_initialized() {
            return;
        }

        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }

        self.buffer = vk::Buffer::null();
        self.memory = vk::DeviceMemory::null();
        self.size = 0;
    }

    pub fn is_initialized(&self) -> bool {
        self.buffer != vk::Buffer::null()
    }

    pub fn native(&self) -> vk::Buffer {
        self.buffer
    }

    /// Size in bytes as requested at creation
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Copy `data` into the buffer. Must be exactly `size()` bytes long.
    pub fn write_data(&mut self, data: &[u8]) -> ComputeResult<()> {
        self.ensure_initialized()?;
        if !validation::check(
            data.len() as vk::DeviceSize == self.size,
            "Incorrect sized data for this buffer",
        ) {
            return Err(ComputeError::Precondition("Incorrect sized data for this buffer"));
        }

        let mapped = self.map(self.size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped, data.len());
            self.device.unmap_memory(self.memory);
        }

        Ok(())
    }

    /// Typed variant of `write_data`
    pub fn write_slice<T: Pod>(&mut self, data: &[T]) -> ComputeResult<()> {
        self.write_data(bytemuck::cast_slice(data))
    }

    /// Make host writes visible to the device. Needed for non-coherent memory,
    /// harmless for coherent memory.
    pub fn flush_write(&mut self) -> ComputeResult<()> {
        self.ensure_initialized()?;
        self.map(vk::WHOLE_SIZE)?;

        let range = self.whole_range();
        let flushed = result::checked(
            unsafe { self.device.flush_mapped_memory_ranges(std::slice::from_ref(&range)) },
            "vkFlushMappedMemoryRanges",
        );
        unsafe { self.device.unmap_memory(self.memory) };

        flushed
    }

    /// Pull device writes into the host view and copy them out as `T`s.
    ///
    /// The buffer size must be a whole number of `T`s.
    pub fn extract_data<T: Pod>(&mut self) -> ComputeResult<Vec<T>> {
        self.ensure_initialized()?;
        let elem_size = std::mem::size_of::<T>() as vk::DeviceSize;
        if !validation::check(
            elem_size != 0 && self.size % elem_size == 0,
            "Buffer size is not a multiple of the element size",
        ) {
            return Err(ComputeError::Precondition(
                "Buffer size is not a multiple of the element size",
            ));
        }

        let mapped = self.map(vk::WHOLE_SIZE)?;

        let range = self.whole_range();
        if let Err(e) = result::checked(
            unsafe { self.device.invalidate_mapped_memory_ranges(std::slice::from_ref(&range)) },
            "vkInvalidateMappedMemoryRanges",
        ) {
            unsafe { self.device.unmap_memory(self.memory) };
            return Err(e);
        }

        // Output is allocated as T so alignment holds whatever the mapping offset
        let mut output = vec![T::zeroed(); (self.size / elem_size) as usize];
        unsafe {
            let bytes = std::slice::from_raw_parts(mapped as *const u8, self.size as usize);
            bytemuck::cast_slice_mut::<T, u8>(&mut output).copy_from_slice(bytes);
            self.device.unmap_memory(self.memory);
        }

        Ok(output)
    }

    fn map(&self, size: vk::DeviceSize) -> ComputeResult<*mut u8> {
        let ptr = result::checked(
            unsafe {
                self.device
                    .map_memory(self.memory, 0, size, vk::MemoryMapFlags::empty())
            },
            "vkMapMemory",
        )?;
        Ok(ptr.cast())
    }

    fn whole_range(&self) -> vk::MappedMemoryRange {
        vk::MappedMemoryRange::builder()
            .memory(self.memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build()
    }

    fn ensure_initialized(&self) -> ComputeResult<()> {
        if validation::check(self.is_initialized(), "Buffer not initialized") {
            Ok(())
        } else {
            Err(ComputeError::Precondition("Buffer not initialized"))
        }
    }
}

impl Drop for MemoryBuffer {
    fn drop(&mut self) {
        if self.is_initialized() {
            self.deinit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;
    const LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = types.len() as u32;
        for (i, &flags) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: flags,
                heap_index: 0,
            };
        }
        props
    }

    #[test]
    fn picks_lowest_compatible_bit() {
        let props = memory_properties(&[LOCAL, HOST | COHERENT, HOST, HOST | COHERENT]);
        assert_eq!(find_memory_type_index(0b1111, &props, HOST), Some(1));
        assert_eq!(find_memory_type_index(0b1100, &props, HOST), Some(2));
        assert_eq!(find_memory_type_index(0b1100, &props, HOST | COHERENT), Some(3));
    }

    #[test]
    fn superset_flags_match() {
        let props = memory_properties(&[LOCAL | HOST | COHERENT]);
        assert_eq!(find_memory_type_index(0b1, &props, LOCAL), Some(0));
        assert_eq!(find_memory_type_index(0b1, &props, vk::MemoryPropertyFlags::empty()), Some(0));
    }

    #[test]
    fn bits_outside_the_mask_are_skipped() {
        let props = memory_properties(&[HOST, LOCAL]);
        assert_eq!(find_memory_type_index(0b10, &props, LOCAL), Some(1));
        assert_eq!(find_memory_type_index(0b10, &props, HOST), None);
    }

    #[test]
    fn no_match_is_none() {
        let props = memory_properties(&[LOCAL, LOCAL]);
        assert_eq!(find_memory_type_index(0b11, &props, HOST), None);
        assert_eq!(find_memory_type_index(0, &props, LOCAL), None);
    }

    #[test]
    fn mask_bits_beyond_type_count_are_ignored() {
        let props = memory_properties(&[LOCAL]);
        assert_eq!(find_memory_type_index(0b110, &props, LOCAL), None);
    }

    #[test]
    fn result_matches_brute_force_search() {
        let props = memory_properties(&[LOCAL, HOST, HOST | COHERENT, LOCAL | HOST, COHERENT]);
        for mask in 0u32..32 {
            for required in [HOST, LOCAL, COHERENT, HOST | COHERENT, LOCAL | HOST] {
                let expected = (0..5u32).find(|&i| {
                    mask & (1 << i) != 0
                        && props.memory_types[i as usize].property_flags & required == required
                });
                assert_eq!(find_memory_type_index(mask, &props, required), expected);
            }
        }
    }
}
