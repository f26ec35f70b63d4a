// Renderer error kinds
//
// Every fallible GPU operation in the backend returns RenderError. The kinds
// separate startup capability problems, resource exhaustion, transient
// presentation failures (handled by a resize) and fatal device loss.

use ash::vk;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    /// A required device capability (queue, feature, extension) is absent
    #[error("Missing capability: {0}")]
    Capability(String),

    /// No memory type is usable by every resource of an allocation request
    #[error("No memory type fits every resource (type bits {type_bits:#x}, required {required:?})")]
    IncompatibleResourceSet {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    /// Every matching memory type failed to provide the block
    #[error("Allocation of {size} bytes failed on all {attempts} compatible memory types")]
    AllocationExhausted { size: u64, attempts: u32 },

    /// Host/device memory or pool exhaustion reported by a specific call
    #[error("{op} ran out of resources (VkResult {})", .code.as_raw())]
    ResourceExhausted { op: &'static str, code: vk::Result },

    /// The surface no longer matches the swapchain; rebuild and continue
    #[error("Surface out of date")]
    SurfaceOutOfDate,

    #[error("{op} timed out (VkResult {})", .code.as_raw())]
    Timeout { op: &'static str, code: vk::Result },

    #[error("Device lost during {op} (VkResult {})", .code.as_raw())]
    DeviceLost { op: &'static str, code: vk::Result },

    /// Any other failed Vulkan call
    #[error("{op} failed (VkResult {})", .code.as_raw())]
    Vulkan { op: &'static str, code: vk::Result },

    #[error("Invalid render graph: {0}")]
    InvalidGraph(String),

    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    /// An acquired image could not be handed back to the queue
    #[error("Frame pipeline unusable after a failed submission")]
    Poisoned,
}

impl RenderError {
    /// Classify a raw Vulkan result for the named operation
    pub fn from_vk(op: &'static str, code: vk::Result) -> Self {
        match code {
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::SurfaceOutOfDate,
            vk::Result::TIMEOUT => Self::Timeout { op, code },
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost { op, code },
            vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_OUT_OF_POOL_MEMORY
            | vk::Result::ERROR_FRAGMENTED_POOL
            | vk::Result::ERROR_FRAGMENTATION => Self::ResourceExhausted { op, code },
            _ => Self::Vulkan { op, code },
        }
    }

    /// Transient errors are answered with a swapchain rebuild, not termination
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SurfaceOutOfDate)
    }

    /// Device loss and unbounded waits have no recovery path in the renderer
    pub fn is_device_loss(&self) -> bool {
        matches!(self, Self::DeviceLost { .. } | Self::Timeout { .. })
    }
}

/// Attach an operation name to a raw `VkResult`
pub trait VkResultExt<T> {
    fn op(self, op: &'static str) -> Result<T, RenderError>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    fn op(self, op: &'static str) -> Result<T, RenderError> {
        self.map_err(|code| RenderError::from_vk(op, code))
    }
}

pub type RenderResult<T> = Result<T, RenderError>;
