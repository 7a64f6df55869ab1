// Backend module - Vulkan compute abstraction layer
//
// Design: Thin wrappers around ash; each owns one Vulkan object
// Lifetime: explicit deinit(), with Drop as a fallback

pub mod buffer;
pub mod command;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod result;
pub mod shader;
pub mod sync;
pub mod validation;

pub use buffer::MemoryBuffer;
pub use command::{CommandLog, CommandPool, CommandRecorder, CommandSink};
pub use engine::{Engine, EngineConfig};
pub use error::{ComputeError, ComputeResult};
pub use pipeline::{
    ComputePipeline, DescriptorPool, DescriptorSetLayout, PipelineCache, PipelineLayout,
};
pub use queue::{Queue, SubmitInfo};
pub use shader::ShaderModule;
pub use sync::{Fence, Semaphore, WAIT_FOREVER};
pub use validation::ValidationPolicy;
