// Shader module loading
//
// Vulkan consumes SPIR-V as 4-byte words. Blobs are checked for length and
// magic number before anything is handed to the driver.

use ash::vk;
use std::ffi::CStr;
use std::path::Path;

use super::error::{ComputeError, ComputeResult};
use super::result;
use super::validation;

/// First word of every SPIR-V module
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Check a SPIR-V blob and convert it to words.
///
/// Rejects blobs whose length is not a multiple of 4 or whose first
/// little-endian word is not `SPIRV_MAGIC`.
pub fn parse_spirv(bytes: &[u8]) -> Option<Vec<u32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return None;
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    (words[0] == SPIRV_MAGIC).then_some(words)
}

pub struct ShaderModule {
    device: ash::Device,
    module: vk::ShaderModule,
}

impl ShaderModule {
    /// Create a module from SPIR-V words
    pub fn new(device: &ash::Device, code: &[u32]) -> ComputeResult<Self> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

        let module = result::checked(
            unsafe { device.create_shader_module(&create_info, None) },
            "vkCreateShaderModule",
        )?;

        Ok(Self {
            device: device.clone(),
            module,
        })
    }

    /// Load and validate a compiled shader from disk
    pub fn from_file(device: &ash::Device, path: impl AsRef<Path>) -> ComputeResult<Self> {
        let code = load_spirv(path)?;
        Self::new(device, &code)
    }

    pub fn deinit(&mut self) {
        validation::check(self.is_initialized(), "Shader module not initialized");
        if self.is_initialized() {
            unsafe { self.device.destroy_shader_module(self.module, None) };
            self.module = vk::ShaderModule::null();
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.module != vk::ShaderModule::null()
    }

    pub fn native(&self) -> vk::ShaderModule {
        self.module
    }

    /// Stage description for pipeline creation. The returned struct borrows
    /// `entry_name` and `specialization`, so keep them alive until the pipeline exists.
    pub fn stage_create_info<'a>(
        &self,
        stage: vk::ShaderStageFlags,
        entry_name: &'a CStr,
        specialization: Option<&'a vk::SpecializationInfo>,
    ) -> ComputeResult<vk::PipelineShaderStageCreateInfoBuilder<'a>> {
        if !validation::check(self.is_initialized(), "Shader module not initialized") {
            return Err(ComputeError::Precondition("Shader module not initialized"));
        }

        let info = vk::PipelineShaderStageCreateInfo::builder()
            .stage(stage)
            .module(self.module)
            .name(entry_name);

        Ok(match specialization {
            Some(specialization) => info.specialization_info(specialization),
            None => info,
        })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        if self.is_initialized() {
            self.deinit();
        }
    }
}

/// Read a file and run it through `parse_spirv`
pub fn load_spirv(path: impl AsRef<Path>) -> ComputeResult<Vec<u32>> {
    let path = path.as_ref();

    let bytes = std::fs::read(path).map_err(|source| {
        log::error!("Failed to load shader at path: {:?}", path);
        ComputeError::ShaderIo {
            path: path.to_path_buf(),
            source,
        }
    })?;

    parse_spirv(&bytes).ok_or_else(|| {
        log::error!("File {:?} is not a valid shader file", path);
        ComputeError::InvalidShaderFile {
            path: path.to_path_buf(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spirv_stub() -> Vec<u8> {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 8]);
        bytes
    }

    fn temp_file(name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("vkcompute-{}-{}", std::process::id(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn valid_blob_becomes_words() {
        let words = parse_spirv(&spirv_stub()).unwrap();
        assert_eq!(words.len(), 4);
        assert_eq!(words[0], SPIRV_MAGIC);
        assert_eq!(words[1], 0x0001_0000);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = spirv_stub();
        bytes[0] = 0xff;
        assert!(parse_spirv(&bytes).is_none());
    }

    #[test]
    fn byte_swapped_magic_is_rejected() {
        let mut bytes = SPIRV_MAGIC.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 4]);
        assert!(parse_spirv(&bytes).is_none());
    }

    #[test]
    fn ragged_length_is_rejected() {
        let mut bytes = spirv_stub();
        bytes.push(0);
        assert!(parse_spirv(&bytes).is_none());
        assert!(parse_spirv(&[]).is_none());
        assert!(parse_spirv(&[0x03, 0x02]).is_none());
    }

    #[test]
    fn load_reports_invalid_files() {
        let path = temp_file("bad.spv", b"not a shader");
        let err = load_spirv(&path).unwrap_err();
        assert!(matches!(err, ComputeError::InvalidShaderFile { .. }));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn load_accepts_valid_files() {
        let path = temp_file("good.spv", &spirv_stub());
        assert_eq!(load_spirv(&path).unwrap()[0], SPIRV_MAGIC);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn load_reports_missing_files() {
        let err = load_spirv("/definitely/not/here.spv").unwrap_err();
        assert!(matches!(err, ComputeError::ShaderIo { .. }));
    }
}
