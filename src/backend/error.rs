// Error types for the compute backend
//
// Native failures carry the function name and the raw vk::Result so callers
// can tell a timeout from a lost device. Everything else is a named condition.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the compute backend
#[derive(Error, Debug)]
pub enum ComputeError {
    /// The Vulkan loader library could not be found or loaded
    #[error("Failed to load Vulkan library: {0}")]
    Loader(#[from] ash::LoadingError),

    /// A Vulkan call returned a non-success status
    #[error("{function}() failed: {code:?}")]
    Vk {
        /// Name of the native function that failed
        function: &'static str,
        /// Status code returned by the driver
        code: vk::Result,
    },

    /// No physical device exposes a compute-capable queue family
    #[error("No supported physical devices (such as GPUs)")]
    NoSupportedDevice,

    /// No memory type satisfies both the buffer requirements and the requested properties
    #[error("No compatible Vulkan memory type found")]
    NoCompatibleMemoryType,

    /// SPIR-V blob failed the length or magic-number check
    #[error("File {path:?} is not a valid shader file")]
    InvalidShaderFile {
        /// Source of the rejected blob
        path: PathBuf,
    },

    /// Shader file could not be read
    #[error("Failed to load shader at path {path:?}")]
    ShaderIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another Engine is already live in this process
    #[error("Engine already exists")]
    AlreadyInitialized,

    /// Caller broke a precondition and the validation policy did not panic
    #[error("Precondition violated: {0}")]
    Precondition(&'static str),
}

impl ComputeError {
    /// Native status code, if this error came from a Vulkan call
    pub fn vk_code(&self) -> Option<vk::Result> {
        match self {
            Self::Vk { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True when a wait gave up before the fence signaled
    pub fn is_timeout(&self) -> bool {
        self.vk_code() == Some(vk::Result::TIMEOUT)
    }
}

/// Result type for backend operations
pub type ComputeResult<T> = Result<T, ComputeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_errors_expose_their_code() {
        let err = ComputeError::Vk {
            function: "vkWaitForFences",
            code: vk::Result::TIMEOUT,
        };
        assert!(err.is_timeout());
        assert_eq!(err.vk_code(), Some(vk::Result::TIMEOUT));
        assert_eq!(err.to_string(), "vkWaitForFences() failed: TIMEOUT");
    }

    #[test]
    fn named_conditions_have_no_code() {
        assert_eq!(ComputeError::NoSupportedDevice.vk_code(), None);
        assert!(!ComputeError::NoCompatibleMemoryType.is_timeout());
    }
}
