// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash. GPU-free seams (DeviceMemoryAllocator,
// ResourceDevice, TransferRecorder, FrameBackend) keep the allocation,
// upload and frame-pacing logic testable without a device.

pub mod attachments;
pub mod descriptor;
pub mod device;
pub mod frame;
pub mod memory;
pub mod pipeline;
pub mod render_graph;
pub mod resource;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod transfer;

pub use device::DeviceContext;
pub use swapchain::Swapchain;
