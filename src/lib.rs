// vkcompute - minimal Vulkan compute orchestration
//
// backend: one wrapper per Vulkan object, plus the result/validation helpers
// compute: the buffer round trip built on top of them

pub mod backend;
pub mod compute;
pub mod config;
