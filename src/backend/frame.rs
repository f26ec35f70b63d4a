// Frame pipeline - N-buffered submission loop
//
// FRAME FLOW (slot = frame number mod N):
// 1. Wait for the slot's fence (its previous submission has finished)
// 2. Acquire a surface image, signalling the slot's image-acquired semaphore
// 3. Record the frame into the slot's command buffer
// 4. Reset the fence and submit, waiting on image-acquired at
//    COLOR_ATTACHMENT_OUTPUT and signalling render-complete + the fence
// 5. Present, waiting on render-complete
//
// The fence wait is the only backpressure: the CPU runs at most N frames
// ahead of the GPU. The fence is reset only right before the submission
// that will signal it again, so an aborted frame never leaves a slot with
// an unsignalled fence.
//
// Once an image is acquired the frame always reaches the queue: if
// recording or the real submission fails, an empty batch consumes the
// image-acquired semaphore, signals render-complete and the fence, and the
// image is presented unchanged. If even that batch cannot be submitted the
// pipeline is poisoned and refuses further frames.

use ash::vk;

use super::device::DeviceContext;
use super::swapchain::{AcquiredImage, Swapchain};
use super::sync::{FrameSlot, FrameState};
use crate::error::{RenderError, RenderResult, VkResultExt};

/// Stage at which the render waits for the acquired image
const ACQUIRE_WAIT_STAGE: vk::PipelineStageFlags = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;

/// One queue submission of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    /// `None` for the empty batch that releases an aborted frame
    pub command_buffer: Option<vk::CommandBuffer>,
    pub wait_semaphore: vk::Semaphore,
    pub wait_stage: vk::PipelineStageFlags,
    pub signal_semaphore: vk::Semaphore,
    pub fence: vk::Fence,
}

/// Queue, fence and swapchain operations driven by the frame pipeline
pub trait FrameBackend {
    fn wait_for_fence(&mut self, fence: vk::Fence) -> RenderResult<()>;

    fn reset_fence(&mut self, fence: vk::Fence) -> RenderResult<()>;

    fn acquire_image(&mut self, signal: vk::Semaphore) -> RenderResult<AcquiredImage>;

    fn begin_commands(&mut self, command_buffer: vk::CommandBuffer) -> RenderResult<()>;

    fn end_commands(&mut self, command_buffer: vk::CommandBuffer) -> RenderResult<()>;

    fn submit(&mut self, submission: &Submission) -> RenderResult<()>;

    /// Present the image; `Ok(true)` when the swapchain should be rebuilt
    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> RenderResult<bool>;
}

/// What a recording callback gets to work with
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    pub slot_index: usize,
    pub frame_number: u64,
    pub image_index: u32,
    pub command_buffer: vk::CommandBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Frame submitted and presented
    Presented { slot: usize, image_index: u32 },
    /// Frame submitted and presented, but the swapchain no longer matches
    Suboptimal { slot: usize, image_index: u32 },
    /// Nothing was submitted; rebuild the swapchain and try again
    OutOfDate,
}

impl FrameOutcome {
    pub fn needs_rebuild(&self) -> bool {
        !matches!(self, Self::Presented { .. })
    }
}

/// Owns the frame slots and the round-robin counter
pub struct FramePipeline {
    slots: Vec<FrameSlot>,
    command_pool: vk::CommandPool,
    next_slot: usize,
    frame_number: u64,
    poisoned: bool,
}

impl FramePipeline {
    /// Create `slot_count` slots with their own command buffers
    pub fn new(context: &DeviceContext, slot_count: usize) -> RenderResult<Self> {
        let device = &context.device;
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(context.graphics_queue().family_index)
            // RESET: each slot's buffer is re-recorded every time it comes round
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool =
            unsafe { device.create_command_pool(&pool_info, None) }.op("vkCreateCommandPool")?;

        let mut pipeline = Self::from_slots(Vec::with_capacity(slot_count));
        pipeline.command_pool = command_pool;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(slot_count as u32);
        let command_buffers = match unsafe { device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers,
            Err(e) => {
                pipeline.destroy(device);
                return Err(RenderError::from_vk("vkAllocateCommandBuffers", e));
            }
        };

        for command_buffer in command_buffers {
            match FrameSlot::new(device, command_buffer) {
                Ok(slot) => pipeline.slots.push(slot),
                Err(e) => {
                    pipeline.destroy(device);
                    return Err(e);
                }
            }
        }

        log::info!("Created {} frame slots", slot_count);
        Ok(pipeline)
    }

    /// Pipeline over existing slots (no command pool of its own)
    pub fn from_slots(slots: Vec<FrameSlot>) -> Self {
        Self {
            slots,
            command_pool: vk::CommandPool::null(),
            next_slot: 0,
            frame_number: 0,
            poisoned: false,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    /// Frames submitted so far
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Slot the next frame will use
    pub fn next_slot(&self) -> usize {
        self.next_slot
    }

    /// Run one frame through the slot state machine.
    ///
    /// `record` is called between begin and end of the slot's command buffer,
    /// after the slot's previous submission is known to be complete, so it
    /// may also rewrite per-slot host-visible data.
    pub fn render_frame<B, F>(&mut self, backend: &mut B, record: F) -> RenderResult<FrameOutcome>
    where
        B: FrameBackend + ?Sized,
        F: FnOnce(&FrameContext) -> RenderResult<()>,
    {
        if self.poisoned {
            return Err(RenderError::Poisoned);
        }
        let slot_index = self.next_slot;
        let frame_number = self.frame_number;
        let slot = self
            .slots
            .get_mut(slot_index)
            .ok_or_else(|| RenderError::Capability("frame pipeline without slots".to_string()))?;

        // FenceWait: the previous use of this slot must be finished
        slot.enter(FrameState::FenceWait);
        backend.wait_for_fence(slot.in_flight_fence)?;

        // Acquiring
        slot.enter(FrameState::Acquiring);
        let acquired = match backend.acquire_image(slot.image_available) {
            Ok(acquired) => acquired,
            Err(e) if e.is_transient() => {
                log::debug!("Surface out of date on acquire (frame {})", frame_number);
                slot.enter(FrameState::Idle);
                return Ok(FrameOutcome::OutOfDate);
            }
            Err(e) => return Err(e),
        };

        // Recording
        slot.enter(FrameState::Recording);
        let context = FrameContext {
            slot_index,
            frame_number,
            image_index: acquired.index,
            command_buffer: slot.command_buffer,
        };
        let recorded = backend
            .begin_commands(slot.command_buffer)
            .and_then(|()| record(&context))
            .and_then(|()| backend.end_commands(slot.command_buffer));
        if let Err(e) = recorded {
            log::warn!("Recording frame {} failed: {}", frame_number, e);
            self.release_acquired(backend, slot_index, acquired.index)?;
            return Err(e);
        }

        // Submitted
        let submitted = backend.reset_fence(slot.in_flight_fence).and_then(|()| {
            backend.submit(&Submission {
                command_buffer: Some(slot.command_buffer),
                wait_semaphore: slot.image_available,
                wait_stage: ACQUIRE_WAIT_STAGE,
                signal_semaphore: slot.render_finished,
                fence: slot.in_flight_fence,
            })
        });
        if let Err(e) = submitted {
            log::warn!("Submitting frame {} failed: {}", frame_number, e);
            self.release_acquired(backend, slot_index, acquired.index)?;
            return Err(e);
        }
        let slot = &mut self.slots[slot_index];
        slot.enter(FrameState::Submitted);
        let render_finished = slot.render_finished;

        self.next_slot = (self.next_slot + 1) % self.slots.len();
        self.frame_number = self.frame_number.wrapping_add(1);

        // Present
        let rebuild = match backend.present(acquired.index, render_finished) {
            Ok(suboptimal) => suboptimal || acquired.suboptimal,
            Err(e) if e.is_transient() => true,
            Err(e) => return Err(e),
        };

        Ok(if rebuild {
            FrameOutcome::Suboptimal {
                slot: slot_index,
                image_index: acquired.index,
            }
        } else {
            FrameOutcome::Presented {
                slot: slot_index,
                image_index: acquired.index,
            }
        })
    }

    /// Hand an acquired image back after its frame was abandoned.
    ///
    /// The slot returns to `Idle` with its fence pending on the empty batch,
    /// and the frame counter does not advance.
    fn release_acquired<B>(
        &mut self,
        backend: &mut B,
        slot_index: usize,
        image_index: u32,
    ) -> RenderResult<()>
    where
        B: FrameBackend + ?Sized,
    {
        let slot = &mut self.slots[slot_index];
        let render_finished = slot.render_finished;
        let released = backend.reset_fence(slot.in_flight_fence).and_then(|()| {
            backend.submit(&Submission {
                command_buffer: None,
                wait_semaphore: slot.image_available,
                wait_stage: ACQUIRE_WAIT_STAGE,
                signal_semaphore: slot.render_finished,
                fence: slot.in_flight_fence,
            })
        });
        slot.enter(FrameState::Idle);
        if let Err(e) = released {
            log::error!("Cannot release image {}: {}", image_index, e);
            self.poisoned = true;
            return Err(e);
        }

        match backend.present(image_index, render_finished) {
            Ok(_) => Ok(()),
            Err(e) if e.is_transient() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn destroy(&self, device: &ash::Device) {
        for slot in &self.slots {
            slot.destroy(device);
        }
        if self.command_pool != vk::CommandPool::null() {
            // Also frees the slots' command buffers
            unsafe { device.destroy_command_pool(self.command_pool, None) };
        }
    }
}

/// FrameBackend on the real device and swapchain
pub struct VulkanFrameBackend<'a> {
    context: &'a DeviceContext,
    swapchain: &'a Swapchain,
    timeout_ns: u64,
}

impl<'a> VulkanFrameBackend<'a> {
    /// `timeout_ns` bounds every fence and acquire wait
    pub fn new(context: &'a DeviceContext, swapchain: &'a Swapchain, timeout_ns: u64) -> Self {
        Self {
            context,
            swapchain,
            timeout_ns,
        }
    }
}

impl FrameBackend for VulkanFrameBackend<'_> {
    fn wait_for_fence(&mut self, fence: vk::Fence) -> RenderResult<()> {
        unsafe {
            self.context
                .device
                .wait_for_fences(&[fence], true, self.timeout_ns)
        }
        .op("vkWaitForFences")
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> RenderResult<()> {
        unsafe { self.context.device.reset_fences(&[fence]) }.op("vkResetFences")
    }

    fn acquire_image(&mut self, signal: vk::Semaphore) -> RenderResult<AcquiredImage> {
        self.swapchain.acquire_next_image(self.timeout_ns, signal)
    }

    fn begin_commands(&mut self, command_buffer: vk::CommandBuffer) -> RenderResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.context
                .device
                .begin_command_buffer(command_buffer, &begin_info)
        }
        .op("vkBeginCommandBuffer")
    }

    fn end_commands(&mut self, command_buffer: vk::CommandBuffer) -> RenderResult<()> {
        unsafe { self.context.device.end_command_buffer(command_buffer) }.op("vkEndCommandBuffer")
    }

    fn submit(&mut self, submission: &Submission) -> RenderResult<()> {
        let wait_semaphores = [submission.wait_semaphore];
        let wait_stages = [submission.wait_stage];
        let signal_semaphores = [submission.signal_semaphore];
        let command_buffers: &[vk::CommandBuffer] = match &submission.command_buffer {
            Some(command_buffer) => std::slice::from_ref(command_buffer),
            None => &[],
        };

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores) // Wait for image to be available
            .wait_dst_stage_mask(&wait_stages) // Which stage waits
            .command_buffers(command_buffers) // Commands to execute
            .signal_semaphores(&signal_semaphores); // Signal when done

        unsafe {
            self.context.device.queue_submit(
                self.context.graphics_queue().handle,
                &[submit_info.build()],
                submission.fence, // Signal this fence when GPU is done
            )
        }
        .op("vkQueueSubmit")
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> RenderResult<bool> {
        self.swapchain
            .present(self.context.graphics_queue().handle, image_index, wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mock_slots, MockQueue, QueueCall};

    #[test]
    fn test_slot_rotation_is_frame_mod_n() {
        let mut pipeline = FramePipeline::from_slots(mock_slots(3));
        let mut queue = MockQueue::new(3);

        for k in 0..12u64 {
            let outcome = pipeline
                .render_frame(&mut queue, |ctx| {
                    assert_eq!(ctx.slot_index as u64, k % 3);
                    assert_eq!(ctx.frame_number, k);
                    Ok(())
                })
                .unwrap();
            assert_eq!(
                outcome,
                FrameOutcome::Presented {
                    slot: (k % 3) as usize,
                    image_index: (k % 3) as u32
                }
            );
        }
        assert_eq!(pipeline.frame_number(), 12);
        assert!(pipeline.slots().iter().all(|slot| slot.uses() == 4));
    }

    #[test]
    fn test_fence_wait_observes_previous_use_of_slot() {
        let mut pipeline = FramePipeline::from_slots(mock_slots(3));
        // The mock GPU retires work lazily, in FIFO order, independent of the
        // order in which fences are waited on
        let mut queue = MockQueue::new(3);

        for _ in 0..10 {
            pipeline.render_frame(&mut queue, |_| Ok(())).unwrap();
        }

        let waits = queue.fence_waits();
        assert_eq!(waits.len(), 10);
        for (k, wait) in waits.iter().enumerate() {
            assert!(wait.submissions_since_reset <= 1);
            if k < 3 {
                // Fresh slots start with a signalled fence
                assert_eq!(wait.last_submission, None);
            } else {
                // Frame k waits on exactly the submission of frame k - N
                assert_eq!(wait.last_submission, Some(k - 3));
                assert_eq!(queue.submissions()[k - 3].fence, wait.fence);
            }
            assert!(wait.completed_on_return);
        }
    }

    #[test]
    fn test_out_of_date_acquire_does_not_consume_the_slot() {
        let mut pipeline = FramePipeline::from_slots(mock_slots(3));
        let mut queue = MockQueue::new(3);

        pipeline.render_frame(&mut queue, |_| Ok(())).unwrap();
        queue.fail_next_acquire(vk::Result::ERROR_OUT_OF_DATE_KHR);
        let outcome = pipeline.render_frame(&mut queue, |_| panic!("must not record")).unwrap();

        assert_eq!(outcome, FrameOutcome::OutOfDate);
        assert!(outcome.needs_rebuild());
        assert_eq!(pipeline.next_slot(), 1);
        assert_eq!(pipeline.frame_number(), 1);
        assert_eq!(pipeline.slots()[1].state(), FrameState::Idle);

        // The fence of slot 1 was never reset, so the retry does not block forever
        let outcome = pipeline.render_frame(&mut queue, |ctx| {
            assert_eq!(ctx.slot_index, 1);
            Ok(())
        });
        assert!(matches!(outcome, Ok(FrameOutcome::Presented { slot: 1, .. })));
    }

    #[test]
    fn test_suboptimal_present_requests_rebuild() {
        let mut pipeline = FramePipeline::from_slots(mock_slots(2));
        let mut queue = MockQueue::new(2);
        queue.fail_next_present(vk::Result::ERROR_OUT_OF_DATE_KHR);

        let outcome = pipeline.render_frame(&mut queue, |_| Ok(())).unwrap();

        assert!(matches!(outcome, FrameOutcome::Suboptimal { slot: 0, .. }));
        // The frame was still submitted
        assert_eq!(pipeline.frame_number(), 1);
        assert_eq!(pipeline.slots()[0].state(), FrameState::Submitted);
    }

    #[test]
    fn test_fence_timeout_is_reported_as_device_loss() {
        let mut pipeline = FramePipeline::from_slots(mock_slots(2));
        let mut queue = MockQueue::new(2);
        queue.fail_next_wait(vk::Result::TIMEOUT);

        let err = pipeline.render_frame(&mut queue, |_| Ok(())).unwrap_err();
        assert!(err.is_device_loss());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_failed_recording_still_releases_the_image() {
        let mut pipeline = FramePipeline::from_slots(mock_slots(2));
        let mut queue = MockQueue::new(2);

        let result = pipeline.render_frame(&mut queue, |_| {
            Err(RenderError::InvalidGraph("broken".to_string()))
        });
        assert!(matches!(result, Err(RenderError::InvalidGraph(_))));
        assert_eq!(pipeline.slots()[0].state(), FrameState::Idle);
        assert_eq!(pipeline.slots()[0].uses(), 0);
        assert_eq!(pipeline.frame_number(), 0);
        assert_eq!(pipeline.next_slot(), 0);

        // An empty batch took over the acquire wait and the fence signal
        let release = queue.submissions()[0];
        assert_eq!(release.command_buffer, None);
        assert_eq!(release.wait_semaphore, pipeline.slots()[0].image_available);
        assert_eq!(release.signal_semaphore, pipeline.slots()[0].render_finished);
        assert_eq!(release.fence, pipeline.slots()[0].in_flight_fence);
        assert_eq!(
            &queue.calls()[3..],
            &[QueueCall::ResetFence, QueueCall::Submit, QueueCall::Present]
        );
        assert_eq!(queue.images_held(), 0);

        for k in 0..6usize {
            let outcome = pipeline.render_frame(&mut queue, |ctx| {
                assert_eq!(ctx.slot_index, k % 2);
                assert_eq!(ctx.frame_number, k as u64);
                Ok(())
            });
            assert!(matches!(outcome, Ok(FrameOutcome::Presented { .. })));
        }
        assert!(queue.violations().is_empty(), "{:?}", queue.violations());
        assert_eq!(queue.images_held(), 0);
        assert_eq!(pipeline.slots()[0].uses(), 3);
        assert_eq!(pipeline.slots()[1].uses(), 3);
    }

    #[test]
    fn test_failed_submit_releases_the_slot() {
        let mut pipeline = FramePipeline::from_slots(mock_slots(2));
        let mut queue = MockQueue::new(2);
        pipeline.render_frame(&mut queue, |_| Ok(())).unwrap();

        queue.fail_next_submits(1, vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        let err = pipeline.render_frame(&mut queue, |_| Ok(())).unwrap_err();
        assert!(matches!(err, RenderError::ResourceExhausted { .. }));
        assert!(!pipeline.is_poisoned());
        assert_eq!(pipeline.slots()[1].state(), FrameState::Idle);
        assert_eq!(pipeline.next_slot(), 1);
        assert_eq!(pipeline.frame_number(), 1);
        assert_eq!(queue.submissions()[1].command_buffer, None);

        // The retry waits on the empty batch's fence instead of deadlocking
        for _ in 0..5 {
            pipeline.render_frame(&mut queue, |_| Ok(())).unwrap();
        }
        assert_eq!(pipeline.frame_number(), 6);
        assert!(queue.violations().is_empty(), "{:?}", queue.violations());
        assert_eq!(queue.images_held(), 0);
    }

    #[test]
    fn test_failed_release_poisons_the_pipeline() {
        let mut pipeline = FramePipeline::from_slots(mock_slots(2));
        let mut queue = MockQueue::new(2);
        queue.fail_next_submits(2, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);

        assert!(pipeline.render_frame(&mut queue, |_| Ok(())).is_err());
        assert!(pipeline.is_poisoned());
        assert_eq!(pipeline.slots()[0].state(), FrameState::Idle);

        let calls_before = queue.calls().len();
        let err = pipeline.render_frame(&mut queue, |_| panic!("must not record")).unwrap_err();
        assert!(matches!(err, RenderError::Poisoned));
        assert!(!err.is_transient());
        assert_eq!(queue.calls().len(), calls_before);
    }

    #[test]
    fn test_step_order_within_a_frame() {
        let mut pipeline = FramePipeline::from_slots(mock_slots(3));
        let mut queue = MockQueue::new(3);
        pipeline.render_frame(&mut queue, |_| Ok(())).unwrap();

        assert_eq!(
            queue.calls(),
            &[
                QueueCall::WaitFence,
                QueueCall::Acquire,
                QueueCall::Begin,
                QueueCall::End,
                QueueCall::ResetFence,
                QueueCall::Submit,
                QueueCall::Present,
            ]
        );
        let submission = queue.submissions()[0];
        assert_eq!(submission.wait_stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(submission.wait_semaphore, pipeline.slots()[0].image_available);
        assert_eq!(submission.signal_semaphore, pipeline.slots()[0].render_finished);
    }
}
