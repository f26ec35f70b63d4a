// Frame slots - per-frame synchronization
//
// A slot bundles the command buffer recorded for one frame with the fence
// that says the GPU is done with it and the two semaphores that order
// acquire -> render -> present. Slots rotate; a slot is only re-recorded
// after its fence from the previous use has signalled.

use ash::vk;

use crate::error::{RenderError, RenderResult, VkResultExt};

/// Where a slot is in its per-frame cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    FenceWait,
    Acquiring,
    Recording,
    Submitted,
}

impl FrameState {
    fn can_enter(self, next: FrameState) -> bool {
        use FrameState::*;
        matches!(
            (self, next),
            (Idle | Submitted, FenceWait)
                | (FenceWait, Acquiring)
                | (Acquiring, Recording)
                | (Acquiring, Idle)
                | (Recording, Idle)
                | (Recording, Submitted)
        )
    }
}

/// One of the N rotating frame contexts
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    state: FrameState,
    uses: u64,
}

impl FrameSlot {
    pub fn new(device: &ash::Device, command_buffer: vk::CommandBuffer) -> RenderResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            let image_available = device
                .create_semaphore(&semaphore_info, None)
                .op("vkCreateSemaphore")?;
            let render_finished = match device.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.destroy_semaphore(image_available, None);
                    return Err(RenderError::from_vk("vkCreateSemaphore", e));
                }
            };
            let in_flight_fence = match device.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(e) => {
                    device.destroy_semaphore(image_available, None);
                    device.destroy_semaphore(render_finished, None);
                    return Err(RenderError::from_vk("vkCreateFence", e));
                }
            };

            Ok(Self::from_handles(
                command_buffer,
                image_available,
                render_finished,
                in_flight_fence,
            ))
        }
    }

    pub fn from_handles(
        command_buffer: vk::CommandBuffer,
        image_available: vk::Semaphore,
        render_finished: vk::Semaphore,
        in_flight_fence: vk::Fence,
    ) -> Self {
        Self {
            command_buffer,
            image_available,
            render_finished,
            in_flight_fence,
            state: FrameState::Idle,
            uses: 0,
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Number of frames submitted from this slot
    pub fn uses(&self) -> u64 {
        self.uses
    }

    pub(crate) fn enter(&mut self, next: FrameState) {
        debug_assert!(
            self.state.can_enter(next),
            "invalid frame slot transition {:?} -> {:?}",
            self.state,
            next
        );
        if next == FrameState::Submitted {
            self.uses += 1;
        }
        self.state = next;
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cycle() {
        use FrameState::*;
        assert!(Idle.can_enter(FenceWait));
        assert!(FenceWait.can_enter(Acquiring));
        assert!(Acquiring.can_enter(Recording));
        assert!(Recording.can_enter(Submitted));
        assert!(Submitted.can_enter(FenceWait));
        // An out-of-date acquire hands the slot back untouched
        assert!(Acquiring.can_enter(Idle));
        // So does a recording that failed before submission
        assert!(Recording.can_enter(Idle));

        assert!(!Idle.can_enter(Recording));
        assert!(!FenceWait.can_enter(Recording));
        assert!(!Submitted.can_enter(Recording));
    }
}
