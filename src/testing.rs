// Test doubles for the device, transfer recorder and frame queue
//
// MockDevice tracks every live buffer, image and allocation so tests can
// assert that nothing leaks. MockQueue models a single FIFO queue whose
// work retires lazily and enforces the fence rules the real driver has.
// Binary semaphore and swapchain image misuse is collected as violations
// instead of panicking, so tests can check the state after an error.

use ash::vk::{self, Handle};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::backend::frame::{FrameBackend, Submission};
use crate::backend::memory::{ByteRange, DeviceMemoryAllocator, MemoryType, MemoryTypeTable};
use crate::backend::resource::{GpuImage, ImageSpec, ResourceDevice};
use crate::backend::swapchain::AcquiredImage;
use crate::backend::sync::FrameSlot;
use crate::backend::transfer::{Barrier, MipBlit, TransferRecorder};
use crate::error::{RenderError, RenderResult};

/// Type 0: device-local. Type 1: host-visible and coherent.
pub fn device_local_and_host_table() -> MemoryTypeTable {
    MemoryTypeTable::new(vec![
        MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
            heap_size: 256 << 20,
        },
        MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 1,
            heap_size: 64 << 20,
        },
    ])
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    CreateBuffer(vk::Buffer),
    CreateImage(vk::Image),
    Allocate { memory_type: u32, size: u64 },
    Free(vk::DeviceMemory),
    BindBuffer(vk::Buffer),
    BindImage(vk::Image),
    Write { size: u64 },
    DestroyBuffer(vk::Buffer),
    DestroyImage(vk::Image),
    Begin,
    Barrier { images: usize, buffers: usize },
    CopyBuffer,
    CopyBufferToImage,
    Blit { level: u32 },
    Submit,
}

pub type EventLog = Rc<RefCell<Vec<Event>>>;

pub struct MockDevice {
    table: MemoryTypeTable,
    log: EventLog,
    next_handle: Cell<u64>,
    buffers: RefCell<HashMap<vk::Buffer, u64>>,
    images: RefCell<HashMap<vk::Image, u64>>,
    memory: RefCell<HashSet<vk::DeviceMemory>>,
    failing_types: RefCell<HashSet<u32>>,
    allocate_calls: Cell<u32>,
    last_write: RefCell<Vec<u8>>,
}

impl MockDevice {
    pub fn new(table: MemoryTypeTable) -> Self {
        Self {
            table,
            log: Rc::new(RefCell::new(Vec::new())),
            next_handle: Cell::new(1),
            buffers: RefCell::new(HashMap::new()),
            images: RefCell::new(HashMap::new()),
            memory: RefCell::new(HashSet::new()),
            failing_types: RefCell::new(HashSet::new()),
            allocate_calls: Cell::new(0),
            last_write: RefCell::new(Vec::new()),
        }
    }

    pub fn memory_table(&self) -> MemoryTypeTable {
        self.table.clone()
    }

    /// Make every allocation from this memory type fail
    pub fn fail_memory_type(&self, index: u32) {
        self.failing_types.borrow_mut().insert(index);
    }

    pub fn log(&self) -> EventLog {
        Rc::clone(&self.log)
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.borrow().clone()
    }

    pub fn allocate_calls(&self) -> u32 {
        self.allocate_calls.get()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.borrow().len()
    }

    pub fn live_images(&self) -> usize {
        self.images.borrow().len()
    }

    pub fn live_memory(&self) -> usize {
        self.memory.borrow().len()
    }

    pub fn last_write(&self) -> Vec<u8> {
        self.last_write.borrow().clone()
    }

    fn handle(&self) -> u64 {
        let id = self.next_handle.get();
        self.next_handle.set(id + 1);
        id
    }

    fn push(&self, event: Event) {
        self.log.borrow_mut().push(event);
    }
}

impl DeviceMemoryAllocator for MockDevice {
    fn allocate_memory(
        &self,
        size: u64,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, vk::Result> {
        self.allocate_calls.set(self.allocate_calls.get() + 1);
        if self.failing_types.borrow().contains(&memory_type_index) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let memory = vk::DeviceMemory::from_raw(self.handle());
        self.memory.borrow_mut().insert(memory);
        self.push(Event::Allocate {
            memory_type: memory_type_index,
            size,
        });
        Ok(memory)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        assert!(self.memory.borrow_mut().remove(&memory), "double free of {memory:?}");
        self.push(Event::Free(memory));
    }
}

impl ResourceDevice for MockDevice {
    fn memory_types(&self) -> &MemoryTypeTable {
        &self.table
    }

    fn buffer_image_granularity(&self) -> u64 {
        1024
    }

    fn create_buffer(
        &self,
        size: u64,
        _usage: vk::BufferUsageFlags,
    ) -> Result<vk::Buffer, vk::Result> {
        let buffer = vk::Buffer::from_raw(self.handle());
        self.buffers.borrow_mut().insert(buffer, size);
        self.push(Event::CreateBuffer(buffer));
        Ok(buffer)
    }

    fn create_image(&self, spec: &ImageSpec) -> Result<vk::Image, vk::Result> {
        let image = vk::Image::from_raw(self.handle());
        let base = spec.payload_size().unwrap_or(spec.width as u64 * spec.height as u64 * 4);
        let size = if spec.mip_levels > 1 { base * 2 } else { base };
        self.images.borrow_mut().insert(image, size);
        self.push(Event::CreateImage(image));
        Ok(image)
    }

    fn buffer_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: self.buffers.borrow().get(&buffer).copied().unwrap_or(0),
            alignment: 16,
            memory_type_bits: 0b11,
        }
    }

    fn image_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: self.images.borrow().get(&image).copied().unwrap_or(0),
            alignment: 256,
            memory_type_bits: 0b01,
        }
    }

    fn bind_buffer(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        _offset: u64,
    ) -> Result<(), vk::Result> {
        assert!(self.memory.borrow().contains(&memory));
        self.push(Event::BindBuffer(buffer));
        Ok(())
    }

    fn bind_image(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        _offset: u64,
    ) -> Result<(), vk::Result> {
        assert!(self.memory.borrow().contains(&memory));
        self.push(Event::BindImage(image));
        Ok(())
    }

    fn write_memory(
        &self,
        memory: vk::DeviceMemory,
        range: ByteRange,
        fill: &mut dyn FnMut(&mut [u8]) -> RenderResult<()>,
    ) -> RenderResult<()> {
        assert!(self.memory.borrow().contains(&memory));
        let mut bytes = vec![0u8; range.size as usize];
        fill(&mut bytes)?;
        self.push(Event::Write { size: range.size });
        *self.last_write.borrow_mut() = bytes;
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        assert!(self.buffers.borrow_mut().remove(&buffer).is_some(), "unknown {buffer:?}");
        self.push(Event::DestroyBuffer(buffer));
    }

    fn destroy_image(&self, image: vk::Image) {
        assert!(self.images.borrow_mut().remove(&image).is_some(), "unknown {image:?}");
        self.push(Event::DestroyImage(image));
    }
}

/// Records transfer commands into the device's event log
pub struct MockRecorder {
    log: EventLog,
    barriers: Vec<Barrier>,
    submissions: u32,
    fail_submit: Option<vk::Result>,
}

impl MockRecorder {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            barriers: Vec::new(),
            submissions: 0,
            fail_submit: None,
        }
    }

    pub fn fail_submit(&mut self, code: vk::Result) {
        self.fail_submit = Some(code);
    }

    pub fn submissions(&self) -> u32 {
        self.submissions
    }

    pub fn barriers(&self) -> &[Barrier] {
        &self.barriers
    }
}

impl TransferRecorder for MockRecorder {
    fn begin(&mut self) -> RenderResult<()> {
        self.log.borrow_mut().push(Event::Begin);
        Ok(())
    }

    fn barrier(&mut self, barrier: &Barrier) {
        self.log.borrow_mut().push(Event::Barrier {
            images: barrier.images.len(),
            buffers: barrier.buffers.len(),
        });
        self.barriers.push(barrier.clone());
    }

    fn copy_buffer(&mut self, _src: vk::Buffer, _dst: vk::Buffer, _region: vk::BufferCopy) {
        self.log.borrow_mut().push(Event::CopyBuffer);
    }

    fn copy_buffer_to_image(&mut self, _src: vk::Buffer, _dst: &GpuImage, _offset: u64) {
        self.log.borrow_mut().push(Event::CopyBufferToImage);
    }

    fn blit_mip(&mut self, _image: &GpuImage, blit: &MipBlit) {
        self.log.borrow_mut().push(Event::Blit { level: blit.level });
    }

    fn submit_and_wait(&mut self) -> RenderResult<()> {
        if let Some(code) = self.fail_submit.take() {
            return Err(RenderError::from_vk("vkQueueSubmit", code));
        }
        self.submissions += 1;
        self.log.borrow_mut().push(Event::Submit);
        Ok(())
    }
}

/// Slots with distinct fabricated handles
pub fn mock_slots(count: usize) -> Vec<FrameSlot> {
    (0..count as u64)
        .map(|i| {
            FrameSlot::from_handles(
                vk::CommandBuffer::from_raw(100 + i),
                vk::Semaphore::from_raw(200 + i),
                vk::Semaphore::from_raw(300 + i),
                vk::Fence::from_raw(400 + i),
            )
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCall {
    WaitFence,
    ResetFence,
    Acquire,
    Begin,
    End,
    Submit,
    Present,
}

/// What a fence wait saw when it was issued
#[derive(Debug, Clone, Copy)]
pub struct FenceWaitRecord {
    pub fence: vk::Fence,
    /// Index of the last submission that signals this fence
    pub last_submission: Option<usize>,
    pub submissions_since_reset: u32,
    pub completed_on_return: bool,
}

#[derive(Debug, Clone, Copy)]
struct FenceState {
    signaled: bool,
    last_submission: Option<usize>,
    submissions_since_reset: u32,
}

impl Default for FenceState {
    // Frame fences are created signalled
    fn default() -> Self {
        Self {
            signaled: true,
            last_submission: None,
            submissions_since_reset: 0,
        }
    }
}

/// One FIFO queue plus a swapchain of `image_count` images
pub struct MockQueue {
    image_count: u32,
    acquires: u32,
    fences: HashMap<vk::Fence, FenceState>,
    submissions: Vec<Submission>,
    completed: usize,
    calls: Vec<QueueCall>,
    waits: Vec<FenceWaitRecord>,
    fail_acquire: Option<vk::Result>,
    fail_present: Option<vk::Result>,
    fail_wait: Option<vk::Result>,
    fail_submits: Vec<vk::Result>,
    /// Binary semaphores with a signal nobody has waited on yet
    pending_signals: HashSet<vk::Semaphore>,
    /// Images acquired and not yet presented
    held_images: HashSet<u32>,
    violations: Vec<String>,
}

impl MockQueue {
    pub fn new(image_count: u32) -> Self {
        Self {
            image_count,
            acquires: 0,
            fences: HashMap::new(),
            submissions: Vec::new(),
            completed: 0,
            calls: Vec::new(),
            waits: Vec::new(),
            fail_acquire: None,
            fail_present: None,
            fail_wait: None,
            fail_submits: Vec::new(),
            pending_signals: HashSet::new(),
            held_images: HashSet::new(),
            violations: Vec::new(),
        }
    }

    pub fn fail_next_acquire(&mut self, code: vk::Result) {
        self.fail_acquire = Some(code);
    }

    pub fn fail_next_present(&mut self, code: vk::Result) {
        self.fail_present = Some(code);
    }

    pub fn fail_next_wait(&mut self, code: vk::Result) {
        self.fail_wait = Some(code);
    }

    /// The next `count` submits fail with `code` and execute nothing
    pub fn fail_next_submits(&mut self, count: usize, code: vk::Result) {
        self.fail_submits.extend(std::iter::repeat(code).take(count));
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    pub fn images_held(&self) -> usize {
        self.held_images.len()
    }

    fn signal(&mut self, semaphore: vk::Semaphore, op: &str) {
        if !self.pending_signals.insert(semaphore) {
            self.violations
                .push(format!("{op} signals {semaphore:?} which already has a pending signal"));
        }
    }

    fn consume(&mut self, semaphore: vk::Semaphore, op: &str) {
        if !self.pending_signals.remove(&semaphore) {
            self.violations
                .push(format!("{op} waits on {semaphore:?} which nothing will signal"));
        }
    }

    pub fn calls(&self) -> &[QueueCall] {
        &self.calls
    }

    pub fn fence_waits(&self) -> &[FenceWaitRecord] {
        &self.waits
    }

    pub fn submissions(&self) -> &[Submission] {
        &self.submissions
    }

    pub fn is_complete(&self, submission: usize) -> bool {
        submission < self.completed
    }

    /// The GPU finishes the oldest outstanding submission
    fn retire_one(&mut self) {
        if let Some(submission) = self.submissions.get(self.completed) {
            let state = self.fences.entry(submission.fence).or_default();
            if state.last_submission == Some(self.completed) {
                state.signaled = true;
            }
            self.completed += 1;
        }
    }
}

impl FrameBackend for MockQueue {
    fn wait_for_fence(&mut self, fence: vk::Fence) -> RenderResult<()> {
        self.calls.push(QueueCall::WaitFence);
        if let Some(code) = self.fail_wait.take() {
            return Err(RenderError::from_vk("vkWaitForFences", code));
        }

        let state = *self.fences.entry(fence).or_default();
        if !state.signaled {
            let target = state.last_submission.unwrap_or_else(|| {
                panic!("{fence:?} is unsignalled with nothing pending: deadlock")
            });
            while self.completed <= target {
                self.retire_one();
            }
        }

        let completed_on_return = self.fences.get(&fence).is_some_and(|s| s.signaled)
            && state.last_submission.map_or(true, |s| self.is_complete(s));
        self.waits.push(FenceWaitRecord {
            fence,
            last_submission: state.last_submission,
            submissions_since_reset: state.submissions_since_reset,
            completed_on_return,
        });
        Ok(())
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> RenderResult<()> {
        self.calls.push(QueueCall::ResetFence);
        let completed = self.completed;
        let state = self.fences.entry(fence).or_default();
        if let Some(last) = state.last_submission {
            assert!(last < completed, "{fence:?} reset while its submission is in flight");
        }
        state.signaled = false;
        state.submissions_since_reset = 0;
        Ok(())
    }

    fn acquire_image(&mut self, signal: vk::Semaphore) -> RenderResult<AcquiredImage> {
        self.calls.push(QueueCall::Acquire);
        if let Some(code) = self.fail_acquire.take() {
            return Err(RenderError::from_vk("vkAcquireNextImageKHR", code));
        }
        self.signal(signal, "vkAcquireNextImageKHR");
        // Background progress: every other acquire the GPU retires one submission
        if self.acquires % 2 == 1 {
            self.retire_one();
        }
        let index = self.acquires % self.image_count;
        self.acquires += 1;
        if !self.held_images.insert(index) {
            self.violations.push(format!("image {index} acquired twice without a present"));
        }
        Ok(AcquiredImage {
            index,
            suboptimal: false,
        })
    }

    fn begin_commands(&mut self, _command_buffer: vk::CommandBuffer) -> RenderResult<()> {
        self.calls.push(QueueCall::Begin);
        Ok(())
    }

    fn end_commands(&mut self, _command_buffer: vk::CommandBuffer) -> RenderResult<()> {
        self.calls.push(QueueCall::End);
        Ok(())
    }

    fn submit(&mut self, submission: &Submission) -> RenderResult<()> {
        self.calls.push(QueueCall::Submit);
        if !self.fail_submits.is_empty() {
            let code = self.fail_submits.remove(0);
            return Err(RenderError::from_vk("vkQueueSubmit", code));
        }
        self.consume(submission.wait_semaphore, "vkQueueSubmit");
        self.signal(submission.signal_semaphore, "vkQueueSubmit");
        let index = self.submissions.len();
        let state = self.fences.entry(submission.fence).or_default();
        assert!(!state.signaled, "{:?} submitted while still signalled", submission.fence);
        state.last_submission = Some(index);
        state.submissions_since_reset += 1;
        self.submissions.push(*submission);
        Ok(())
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> RenderResult<bool> {
        self.calls.push(QueueCall::Present);
        // An out-of-date present still releases the image and its wait
        self.consume(wait, "vkQueuePresentKHR");
        if !self.held_images.remove(&image_index) {
            self.violations.push(format!("image {image_index} presented without being acquired"));
        }
        if let Some(code) = self.fail_present.take() {
            return Err(RenderError::from_vk("vkQueuePresentKHR", code));
        }
        Ok(false)
    }
}
