// Staged transfer - CPU data into device-local resources
//
// One upload call is one transaction: create and bind every destination,
// pack all payloads into a single host-visible staging buffer, record
// barrier -> copies -> mip blits -> barrier, submit, wait for the queue to
// drain and only then release the staging buffer.
//
// On failure everything the transaction created is destroyed again; the
// caller either gets every resource bound and initialised, or nothing.

use ash::vk;

use super::device::DeviceContext;
use super::memory::{suballocate, ByteRange, MemoryBlock, MemoryRequirement};
use super::resource::{GpuBuffer, GpuImage, GpuResource, ImageSpec, ResourceDevice};
use crate::error::{RenderError, RenderResult, VkResultExt};

/// Offset alignment of buffer->image copies for every format we upload
const STAGING_ALIGNMENT: u64 = 4;

#[derive(Debug, Clone, Copy)]
pub enum UploadTarget {
    Buffer {
        size: u64,
        usage: vk::BufferUsageFlags,
    },
    Image(ImageSpec),
}

/// Layout/access a resource is left in once the transaction completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SteadyState {
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags,
    pub stage: vk::PipelineStageFlags,
}

impl SteadyState {
    pub fn buffer(access: vk::AccessFlags, stage: vk::PipelineStageFlags) -> Self {
        Self {
            layout: vk::ImageLayout::UNDEFINED,
            access,
            stage,
        }
    }

    pub fn image(
        layout: vk::ImageLayout,
        access: vk::AccessFlags,
        stage: vk::PipelineStageFlags,
    ) -> Self {
        Self {
            layout,
            access,
            stage,
        }
    }
}

/// One destination of an upload transaction
#[derive(Debug, Clone, Copy)]
pub struct Upload<'a> {
    pub target: UploadTarget,
    pub data: Option<&'a [u8]>,
    pub generate_mips: bool,
    pub steady: SteadyState,
}

impl<'a> Upload<'a> {
    pub fn buffer(data: &'a [u8], usage: vk::BufferUsageFlags, steady: SteadyState) -> Self {
        Self {
            target: UploadTarget::Buffer {
                size: data.len() as u64,
                usage,
            },
            data: Some(data),
            generate_mips: false,
            steady,
        }
    }

    pub fn image(spec: ImageSpec, data: Option<&'a [u8]>, steady: SteadyState) -> Self {
        Self {
            target: UploadTarget::Image(spec),
            data,
            generate_mips: false,
            steady,
        }
    }

    /// Fill levels 1.. by successive half-size blits of level 0
    pub fn with_mips(mut self) -> Self {
        self.generate_mips = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransition {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub base_mip_level: u32,
    pub level_count: u32,
    pub layer_count: u32,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferTransition {
    pub buffer: vk::Buffer,
    pub size: u64,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

/// One vkCmdPipelineBarrier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Barrier {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub images: Vec<ImageTransition>,
    pub buffers: Vec<BufferTransition>,
}

impl Barrier {
    fn new(src_stage: vk::PipelineStageFlags, dst_stage: vk::PipelineStageFlags) -> Self {
        Self {
            src_stage,
            dst_stage,
            images: Vec::new(),
            buffers: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.images.is_empty() && self.buffers.is_empty()
    }
}

/// Blit of level `level - 1` (src extent) into `level` (dst extent)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MipBlit {
    pub level: u32,
    pub src_extent: (u32, u32),
    pub dst_extent: (u32, u32),
}

/// Half-size blits from level 0 until the level count runs out or the
/// image reaches 1x1
pub fn mip_chain(width: u32, height: u32, mip_levels: u32) -> Vec<MipBlit> {
    let mut blits = Vec::new();
    let (mut w, mut h) = (width.max(1), height.max(1));
    let mut level = 1;

    while level < mip_levels && (w > 1 || h > 1) {
        let next = ((w / 2).max(1), (h / 2).max(1));
        blits.push(MipBlit {
            level,
            src_extent: (w, h),
            dst_extent: next,
        });
        (w, h) = next;
        level += 1;
    }

    blits
}

/// Back-to-back placement of every payload inside the staging buffer
pub fn plan_staging(uploads: &[Upload]) -> (Vec<Option<ByteRange>>, u64) {
    let mut running = 0u64;
    let ranges = uploads
        .iter()
        .map(|upload| {
            upload.data.map(|data| {
                let offset = running.div_ceil(STAGING_ALIGNMENT) * STAGING_ALIGNMENT;
                running = offset + data.len() as u64;
                ByteRange::new(offset, data.len() as u64)
            })
        })
        .collect();
    (ranges, running)
}

/// Command recording and submission of a transfer transaction
pub trait TransferRecorder {
    fn begin(&mut self) -> RenderResult<()>;

    fn barrier(&mut self, barrier: &Barrier);

    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, region: vk::BufferCopy);

    fn copy_buffer_to_image(&mut self, src: vk::Buffer, dst: &GpuImage, offset: u64);

    fn blit_mip(&mut self, image: &GpuImage, blit: &MipBlit);

    /// Submit what was recorded and block until the queue has drained
    fn submit_and_wait(&mut self) -> RenderResult<()>;
}

/// Resources initialised by one transaction, in request order
#[derive(Debug)]
pub struct UploadBatch {
    pub memory: MemoryBlock,
    pub resources: Vec<GpuResource>,
}

impl UploadBatch {
    pub fn buffer(&self, index: usize) -> RenderResult<&GpuBuffer> {
        self.resources
            .get(index)
            .and_then(GpuResource::as_buffer)
            .ok_or_else(|| RenderError::InvalidUpload(format!("resource {index} is not a buffer")))
    }

    pub fn image(&self, index: usize) -> RenderResult<&GpuImage> {
        self.resources
            .get(index)
            .and_then(GpuResource::as_image)
            .ok_or_else(|| RenderError::InvalidUpload(format!("resource {index} is not an image")))
    }

    pub fn destroy<D: ResourceDevice + ?Sized>(self, device: &D) {
        for resource in &self.resources {
            resource.destroy(device);
        }
        self.memory.free(device);
    }
}

/// Destroys what a transaction created unless it completes
struct Pending<'d, D: ResourceDevice + ?Sized> {
    device: &'d D,
    resources: Vec<GpuResource>,
    memory: Option<MemoryBlock>,
}

impl<'d, D: ResourceDevice + ?Sized> Pending<'d, D> {
    fn new(device: &'d D) -> Self {
        Self {
            device,
            resources: Vec::new(),
            memory: None,
        }
    }

    fn commit(mut self) -> RenderResult<UploadBatch> {
        let memory = self
            .memory
            .take()
            .ok_or_else(|| RenderError::InvalidUpload("transaction without memory".to_string()))?;
        Ok(UploadBatch {
            memory,
            resources: std::mem::take(&mut self.resources),
        })
    }
}

impl<D: ResourceDevice + ?Sized> Drop for Pending<'_, D> {
    fn drop(&mut self) {
        if self.resources.is_empty() && self.memory.is_none() {
            return;
        }
        log::warn!(
            "Rolling back upload: destroying {} resources",
            self.resources.len()
        );
        for resource in &self.resources {
            resource.destroy(self.device);
        }
        if let Some(memory) = self.memory.take() {
            memory.free(self.device);
        }
    }
}

/// Staging buffer plus its memory, released when dropped
struct Staging<'d, D: ResourceDevice + ?Sized> {
    device: &'d D,
    buffer: vk::Buffer,
    memory: Option<MemoryBlock>,
}

impl<D: ResourceDevice + ?Sized> Drop for Staging<'_, D> {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.buffer);
        if let Some(memory) = self.memory.take() {
            memory.free(self.device);
        }
    }
}

fn validate(uploads: &[Upload]) -> RenderResult<()> {
    if uploads.is_empty() {
        return Err(RenderError::InvalidUpload("empty transaction".to_string()));
    }
    for (index, upload) in uploads.iter().enumerate() {
        match upload.target {
            UploadTarget::Buffer { size, .. } => {
                if size == 0 {
                    return Err(RenderError::InvalidUpload(format!("buffer {index} is empty")));
                }
                if upload.generate_mips {
                    return Err(RenderError::InvalidUpload(format!(
                        "buffer {index} cannot generate mips"
                    )));
                }
                if upload.data.is_some_and(|data| data.len() as u64 != size) {
                    return Err(RenderError::InvalidUpload(format!(
                        "buffer {index} payload does not match its size"
                    )));
                }
            }
            UploadTarget::Image(spec) => {
                if let Some(data) = upload.data {
                    let expected = spec.payload_size().ok_or_else(|| {
                        RenderError::InvalidUpload(format!(
                            "image {index} has unsupported upload format {:?}",
                            spec.format
                        ))
                    })?;
                    if data.len() as u64 != expected {
                        return Err(RenderError::InvalidUpload(format!(
                            "image {index} payload is {} bytes, expected {}",
                            data.len(),
                            expected
                        )));
                    }
                } else if upload.generate_mips {
                    return Err(RenderError::InvalidUpload(format!(
                        "image {index} generates mips without data"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Run one staged upload transaction
pub fn upload<D, R>(device: &D, recorder: &mut R, uploads: &[Upload]) -> RenderResult<UploadBatch>
where
    D: ResourceDevice + ?Sized,
    R: TransferRecorder + ?Sized,
{
    validate(uploads)?;

    // Step 1: create destinations and back them with one device-local block
    let mut pending = Pending::new(device);
    let mut requirements = Vec::with_capacity(uploads.len());

    for upload in uploads {
        match upload.target {
            UploadTarget::Buffer { size, usage } => {
                let usage = if upload.data.is_some() {
                    usage | vk::BufferUsageFlags::TRANSFER_DST
                } else {
                    usage
                };
                let handle = device.create_buffer(size, usage).op("vkCreateBuffer")?;
                pending.resources.push(GpuResource::Buffer(GpuBuffer {
                    handle,
                    size,
                    usage,
                    access: vk::AccessFlags::empty(),
                    region: ByteRange::default(),
                }));
                requirements.push(MemoryRequirement::buffer(device.buffer_requirements(handle)));
            }
            UploadTarget::Image(mut spec) => {
                if upload.data.is_some() {
                    spec.usage |= vk::ImageUsageFlags::TRANSFER_DST;
                }
                if upload.generate_mips {
                    spec.usage |= vk::ImageUsageFlags::TRANSFER_SRC;
                }
                let handle = device.create_image(&spec).op("vkCreateImage")?;
                pending.resources.push(GpuResource::Image(GpuImage {
                    handle,
                    spec,
                    layout: vk::ImageLayout::UNDEFINED,
                    access: vk::AccessFlags::empty(),
                    region: ByteRange::default(),
                }));
                requirements.push(MemoryRequirement::image(device.image_requirements(handle)));
            }
        }
    }

    let block = suballocate(
        device,
        device.memory_types(),
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        &requirements,
        device.buffer_image_granularity(),
    )?;
    let memory = block.handle();
    let regions = block.regions().to_vec();
    pending.memory = Some(block);

    for (resource, region) in pending.resources.iter_mut().zip(regions) {
        match resource {
            GpuResource::Buffer(buffer) => {
                buffer.region = region;
                device
                    .bind_buffer(buffer.handle, memory, region.offset)
                    .op("vkBindBufferMemory")?;
            }
            GpuResource::Image(image) => {
                image.region = region;
                device
                    .bind_image(image.handle, memory, region.offset)
                    .op("vkBindImageMemory")?;
            }
        }
    }

    // Step 2: one host-visible staging buffer for every payload
    let (staging_ranges, staging_size) = plan_staging(uploads);
    let staging = if staging_size > 0 {
        let buffer = device
            .create_buffer(staging_size, vk::BufferUsageFlags::TRANSFER_SRC)
            .op("vkCreateBuffer")?;
        let mut staging = Staging {
            device,
            buffer,
            memory: None,
        };
        let requirement = MemoryRequirement::buffer(device.buffer_requirements(buffer));
        let block = suballocate(
            device,
            device.memory_types(),
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            &[requirement],
            device.buffer_image_granularity(),
        )?;
        let staging_memory = block.handle();
        staging.memory = Some(block);

        device.write_memory(
            staging_memory,
            ByteRange::new(0, staging_size),
            &mut |bytes| {
                for (upload, range) in uploads.iter().zip(&staging_ranges) {
                    if let (Some(data), Some(range)) = (upload.data, range) {
                        range.slice_mut(bytes)?.copy_from_slice(data);
                    }
                }
                Ok(())
            },
        )?;
        device
            .bind_buffer(buffer, staging_memory, 0)
            .op("vkBindBufferMemory")?;
        Some(staging)
    } else {
        None
    };

    recorder.begin()?;

    // Step 3: undefined -> transfer destination for everything we copy into
    let mut to_transfer = Barrier::new(
        vk::PipelineStageFlags::TOP_OF_PIPE,
        vk::PipelineStageFlags::TRANSFER,
    );
    for (resource, upload) in pending.resources.iter().zip(uploads) {
        if upload.data.is_none() {
            continue;
        }
        match resource {
            GpuResource::Buffer(buffer) => to_transfer.buffers.push(BufferTransition {
                buffer: buffer.handle,
                size: buffer.size,
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::TRANSFER_WRITE,
            }),
            GpuResource::Image(image) => to_transfer.images.push(ImageTransition {
                image: image.handle,
                aspect: image.spec.aspect,
                base_mip_level: 0,
                level_count: image.spec.mip_levels,
                layer_count: image.spec.array_layers,
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::TRANSFER_WRITE,
            }),
        }
    }
    if !to_transfer.is_empty() {
        recorder.barrier(&to_transfer);
    }

    // Step 4: one copy per payload
    if let Some(staging) = &staging {
        for (resource, range) in pending.resources.iter().zip(&staging_ranges) {
            let Some(range) = range else { continue };
            match resource {
                GpuResource::Buffer(buffer) => recorder.copy_buffer(
                    staging.buffer,
                    buffer.handle,
                    vk::BufferCopy {
                        src_offset: range.offset,
                        dst_offset: 0,
                        size: range.size,
                    },
                ),
                GpuResource::Image(image) => {
                    recorder.copy_buffer_to_image(staging.buffer, image, range.offset)
                }
            }
        }
    }

    // Step 5: mip chains; each source level becomes readable before its blit
    let mut generated_levels = vec![1u32; uploads.len()];
    for (index, (resource, upload)) in pending.resources.iter().zip(uploads).enumerate() {
        let GpuResource::Image(image) = resource else { continue };
        if !upload.generate_mips {
            continue;
        }
        let blits = mip_chain(image.spec.width, image.spec.height, image.spec.mip_levels);
        for blit in &blits {
            let mut readable = Barrier::new(
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
            );
            readable.images.push(ImageTransition {
                image: image.handle,
                aspect: image.spec.aspect,
                base_mip_level: blit.level - 1,
                level_count: 1,
                layer_count: image.spec.array_layers,
                old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::TRANSFER_READ,
            });
            recorder.barrier(&readable);
            recorder.blit_mip(image, blit);
        }
        generated_levels[index] = blits.len() as u32 + 1;
    }

    // Step 6: everything to its steady state
    let src_stage = if staging.is_some() {
        vk::PipelineStageFlags::TRANSFER
    } else {
        vk::PipelineStageFlags::TOP_OF_PIPE
    };
    let dst_stage = uploads
        .iter()
        .fold(vk::PipelineStageFlags::empty(), |stages, upload| {
            stages | upload.steady.stage
        });
    let dst_stage = if dst_stage.is_empty() {
        vk::PipelineStageFlags::BOTTOM_OF_PIPE
    } else {
        dst_stage
    };
    let mut to_steady = Barrier::new(src_stage, dst_stage);

    for (index, (resource, upload)) in pending.resources.iter_mut().zip(uploads).enumerate() {
        match resource {
            GpuResource::Buffer(buffer) => {
                if upload.data.is_some() {
                    to_steady.buffers.push(BufferTransition {
                        buffer: buffer.handle,
                        size: buffer.size,
                        src_access: vk::AccessFlags::TRANSFER_WRITE,
                        dst_access: upload.steady.access,
                    });
                }
                buffer.access = upload.steady.access;
            }
            GpuResource::Image(image) => {
                let spec = image.spec;
                let transition = |base: u32, count: u32, old, src_access| ImageTransition {
                    image: image.handle,
                    aspect: spec.aspect,
                    base_mip_level: base,
                    level_count: count,
                    layer_count: spec.array_layers,
                    old_layout: old,
                    new_layout: upload.steady.layout,
                    src_access,
                    dst_access: upload.steady.access,
                };
                if upload.data.is_none() {
                    to_steady.images.push(transition(
                        0,
                        spec.mip_levels,
                        vk::ImageLayout::UNDEFINED,
                        vk::AccessFlags::empty(),
                    ));
                } else {
                    // Levels that fed a blit sit in TRANSFER_SRC, the rest in TRANSFER_DST
                    let sources = generated_levels[index] - 1;
                    if sources > 0 {
                        to_steady.images.push(transition(
                            0,
                            sources,
                            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            vk::AccessFlags::TRANSFER_READ,
                        ));
                    }
                    to_steady.images.push(transition(
                        sources,
                        spec.mip_levels - sources,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::AccessFlags::TRANSFER_WRITE,
                    ));
                }
                image.layout = upload.steady.layout;
                image.access = upload.steady.access;
            }
        }
    }
    if !to_steady.is_empty() {
        recorder.barrier(&to_steady);
    }

    // Step 7: submit, drain, then release the staging buffer
    recorder.submit_and_wait()?;
    drop(staging);

    log::debug!(
        "Uploaded {} resources ({} staging bytes)",
        uploads.len(),
        staging_size
    );
    pending.commit()
}

/// Immediate-submit command buffer on the shared graphics queue
pub struct TransferContext {
    device: ash::Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
}

impl TransferContext {
    pub fn new(context: &DeviceContext) -> RenderResult<Self> {
        let queue = context.graphics_queue();
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue.family_index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let command_pool = unsafe { context.device.create_command_pool(&pool_info, None) }
            .op("vkCreateCommandPool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = match unsafe { context.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { context.device.destroy_command_pool(command_pool, None) };
                return Err(RenderError::from_vk("vkAllocateCommandBuffers", e));
            }
        };

        Ok(Self {
            device: context.device.clone(),
            queue: queue.handle,
            command_pool,
            command_buffer,
        })
    }

    pub fn destroy(&self) {
        unsafe { self.device.destroy_command_pool(self.command_pool, None) };
    }
}

impl TransferRecorder for TransferContext {
    fn begin(&mut self) -> RenderResult<()> {
        unsafe {
            self.device
                .reset_command_pool(self.command_pool, vk::CommandPoolResetFlags::empty())
                .op("vkResetCommandPool")?;
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(self.command_buffer, &begin_info)
                .op("vkBeginCommandBuffer")
        }
    }

    fn barrier(&mut self, barrier: &Barrier) {
        let images: Vec<vk::ImageMemoryBarrier> = barrier
            .images
            .iter()
            .map(|t| {
                vk::ImageMemoryBarrier::builder()
                    .src_access_mask(t.src_access)
                    .dst_access_mask(t.dst_access)
                    .old_layout(t.old_layout)
                    .new_layout(t.new_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(t.image)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: t.aspect,
                        base_mip_level: t.base_mip_level,
                        level_count: t.level_count,
                        base_array_layer: 0,
                        layer_count: t.layer_count,
                    })
                    .build()
            })
            .collect();
        let buffers: Vec<vk::BufferMemoryBarrier> = barrier
            .buffers
            .iter()
            .map(|t| {
                vk::BufferMemoryBarrier::builder()
                    .src_access_mask(t.src_access)
                    .dst_access_mask(t.dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(t.buffer)
                    .offset(0)
                    .size(t.size)
                    .build()
            })
            .collect();

        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                barrier.src_stage,
                barrier.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &buffers,
                &images,
            );
        }
    }

    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, region: vk::BufferCopy) {
        unsafe {
            self.device
                .cmd_copy_buffer(self.command_buffer, src, dst, &[region]);
        }
    }

    fn copy_buffer_to_image(&mut self, src: vk::Buffer, dst: &GpuImage, offset: u64) {
        let region = vk::BufferImageCopy {
            buffer_offset: offset,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: dst.spec.aspect,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: dst.spec.array_layers,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: dst.spec.extent(),
        };
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                self.command_buffer,
                src,
                dst.handle,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }

    fn blit_mip(&mut self, image: &GpuImage, blit: &MipBlit) {
        let layers = |level| vk::ImageSubresourceLayers {
            aspect_mask: image.spec.aspect,
            mip_level: level,
            base_array_layer: 0,
            layer_count: image.spec.array_layers,
        };
        let corner = |(w, h): (u32, u32)| vk::Offset3D {
            x: w as i32,
            y: h as i32,
            z: 1,
        };
        let region = vk::ImageBlit {
            src_subresource: layers(blit.level - 1),
            src_offsets: [vk::Offset3D::default(), corner(blit.src_extent)],
            dst_subresource: layers(blit.level),
            dst_offsets: [vk::Offset3D::default(), corner(blit.dst_extent)],
        };
        unsafe {
            self.device.cmd_blit_image(
                self.command_buffer,
                image.handle,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image.handle,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                vk::Filter::LINEAR,
            );
        }
    }

    fn submit_and_wait(&mut self) -> RenderResult<()> {
        unsafe {
            self.device
                .end_command_buffer(self.command_buffer)
                .op("vkEndCommandBuffer")?;
            let command_buffers = [self.command_buffer];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            self.device
                .queue_submit(self.queue, &[submit_info.build()], vk::Fence::null())
                .op("vkQueueSubmit")?;
            self.device.queue_wait_idle(self.queue).op("vkQueueWaitIdle")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{device_local_and_host_table, Event, MockDevice, MockRecorder};

    fn vertex_steady() -> SteadyState {
        SteadyState::buffer(
            vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
            vk::PipelineStageFlags::VERTEX_INPUT,
        )
    }

    fn texture_steady() -> SteadyState {
        SteadyState::image(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        )
    }

    #[test]
    fn test_mip_chain_terminates() {
        for &(w, h) in &[(1, 1), (2, 2), (7, 3), (256, 256), (1024, 1), (5, 1000), (640, 480)] {
            for requested in 1..14u32 {
                let blits = mip_chain(w, h, requested);
                assert!(blits.len() as u32 <= requested.saturating_sub(1));
                let bound = (w.max(h) as f64).log2().ceil() as usize + 1;
                assert!(blits.len() <= bound, "{w}x{h}: {} blits", blits.len());

                let mut previous = w.max(h);
                for (i, blit) in blits.iter().enumerate() {
                    assert_eq!(blit.level, i as u32 + 1);
                    let (sw, sh) = blit.src_extent;
                    let (dw, dh) = blit.dst_extent;
                    assert_eq!((dw, dh), ((sw / 2).max(1), (sh / 2).max(1)));
                    assert!(dw.max(dh) < previous);
                    previous = dw.max(dh);
                }
            }
        }
    }

    #[test]
    fn test_mip_chain_stops_at_one_by_one() {
        let blits = mip_chain(8, 2, 10);
        let extents: Vec<_> = blits.iter().map(|b| b.dst_extent).collect();
        assert_eq!(extents, vec![(4, 1), (2, 1), (1, 1)]);
    }

    #[test]
    fn test_staging_is_packed_back_to_back() {
        let a = [1u8; 6];
        let b = [2u8; 8];
        let uploads = [
            Upload::buffer(&a, vk::BufferUsageFlags::VERTEX_BUFFER, vertex_steady()),
            Upload::image(
                ImageSpec::attachment(
                    4,
                    4,
                    vk::Format::D32_SFLOAT,
                    vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                    vk::ImageAspectFlags::DEPTH,
                ),
                None,
                texture_steady(),
            ),
            Upload::buffer(&b, vk::BufferUsageFlags::INDEX_BUFFER, vertex_steady()),
        ];
        let (ranges, total) = plan_staging(&uploads);
        assert_eq!(ranges[0], Some(ByteRange::new(0, 6)));
        assert_eq!(ranges[1], None);
        assert_eq!(ranges[2], Some(ByteRange::new(8, 8)));
        assert_eq!(total, 16);
    }

    #[test]
    fn test_upload_protocol_order() {
        let device = MockDevice::new(device_local_and_host_table());
        let mut recorder = MockRecorder::new(device.log());
        let vertices = [0u8; 96];
        let pixels = [0xFFu8; 8 * 8 * 4];
        let uploads = [
            Upload::buffer(&vertices, vk::BufferUsageFlags::VERTEX_BUFFER, vertex_steady()),
            Upload::image(
                ImageSpec::texture(8, 8, vk::Format::R8G8B8A8_SRGB),
                Some(&pixels),
                texture_steady(),
            )
            .with_mips(),
        ];

        let batch = upload(&device, &mut recorder, &uploads).unwrap();

        let texture = batch.image(1).unwrap();
        assert_eq!(texture.spec.mip_levels, 4);
        assert_eq!(texture.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert!(texture.spec.usage.contains(vk::ImageUsageFlags::TRANSFER_SRC));
        assert_eq!(batch.buffer(0).unwrap().access, vk::AccessFlags::VERTEX_ATTRIBUTE_READ);

        // The whole transaction ran as one submission
        assert_eq!(recorder.submissions(), 1);

        let events = device.events();
        let position = |wanted: &dyn Fn(&Event) -> bool| {
            events
                .iter()
                .position(|e| wanted(e))
                .unwrap_or_else(|| panic!("missing event in {events:?}"))
        };
        let begin = position(&|e| matches!(e, Event::Begin));
        let first_barrier = position(&|e| matches!(e, Event::Barrier { .. }));
        let copy = position(&|e| matches!(e, Event::CopyBuffer));
        let copy_image = position(&|e| matches!(e, Event::CopyBufferToImage));
        let first_blit = position(&|e| matches!(e, Event::Blit { level: 1 }));
        let submit = position(&|e| matches!(e, Event::Submit));
        let staging_destroyed = position(&|e| matches!(e, Event::DestroyBuffer(_)));

        assert!(begin < first_barrier);
        assert!(first_barrier < copy && copy < copy_image);
        assert!(copy_image < first_blit);
        assert!(first_blit < submit);
        assert!(submit < staging_destroyed);

        // Each blit is preceded by a barrier making its source level readable
        let blits: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, Event::Blit { .. }))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(blits.len(), 3);
        for &i in &blits {
            assert!(matches!(events[i - 1], Event::Barrier { .. }));
        }

        // Final barrier covers levels 0..3 from TRANSFER_SRC and level 3 from TRANSFER_DST
        let last = recorder.barriers().last().cloned().unwrap();
        let texture_transitions: Vec<_> = last
            .images
            .iter()
            .filter(|t| t.image == texture.handle)
            .collect();
        assert_eq!(texture_transitions.len(), 2);
        assert_eq!(texture_transitions[0].old_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(texture_transitions[0].level_count, 3);
        assert_eq!(texture_transitions[1].old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(texture_transitions[1].base_mip_level, 3);

        // Only the destination block survives the transaction
        assert_eq!(device.live_memory(), 1);
        assert_eq!(device.live_buffers(), 1);
        batch.destroy(&device);
        assert_eq!(device.live_memory(), 0);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_images(), 0);
    }

    #[test]
    fn test_staging_bytes_match_payloads() {
        let device = MockDevice::new(device_local_and_host_table());
        let mut recorder = MockRecorder::new(device.log());
        let a = [7u8; 10];
        let b = [9u8; 4];
        let uploads = [
            Upload::buffer(&a, vk::BufferUsageFlags::VERTEX_BUFFER, vertex_steady()),
            Upload::buffer(&b, vk::BufferUsageFlags::INDEX_BUFFER, vertex_steady()),
        ];
        let batch = upload(&device, &mut recorder, &uploads).unwrap();

        let written = device.last_write();
        assert_eq!(written.len(), 16);
        assert_eq!(&written[..10], &a);
        assert_eq!(&written[12..], &b);
        batch.destroy(&device);
    }

    #[test]
    fn test_attachment_without_data_goes_straight_to_steady_state() {
        let device = MockDevice::new(device_local_and_host_table());
        let mut recorder = MockRecorder::new(device.log());
        let spec = ImageSpec::attachment(
            64,
            64,
            vk::Format::R32G32B32A32_SFLOAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
            vk::ImageAspectFlags::COLOR,
        );
        let uploads = [Upload::image(
            spec,
            None,
            SteadyState::image(
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            ),
        )];
        let batch = upload(&device, &mut recorder, &uploads).unwrap();

        let image = batch.image(0).unwrap();
        assert!(!image.spec.usage.contains(vk::ImageUsageFlags::TRANSFER_DST));
        let barriers = recorder.barriers();
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].images[0].old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(
            barriers[0].images[0].new_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        // No payload, no staging buffer
        assert_eq!(device.live_buffers(), 0);
        batch.destroy(&device);
    }

    #[test]
    fn test_failed_staging_allocation_rolls_back() {
        let device = MockDevice::new(device_local_and_host_table());
        // Type 1 is the only host-visible type: the staging block cannot be allocated
        device.fail_memory_type(1);
        let mut recorder = MockRecorder::new(device.log());
        let vertices = [0u8; 64];
        let pixels = [0u8; 16 * 16 * 4];
        let uploads = [
            Upload::buffer(&vertices, vk::BufferUsageFlags::VERTEX_BUFFER, vertex_steady()),
            Upload::image(
                ImageSpec::texture(16, 16, vk::Format::R8G8B8A8_UNORM),
                Some(&pixels),
                texture_steady(),
            ),
        ];

        let result = upload(&device, &mut recorder, &uploads);

        assert!(matches!(result, Err(RenderError::AllocationExhausted { .. })));
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_images(), 0);
        assert_eq!(device.live_memory(), 0);
        assert_eq!(recorder.submissions(), 0);
    }

    #[test]
    fn test_failed_submit_rolls_back_everything() {
        let device = MockDevice::new(device_local_and_host_table());
        let mut recorder = MockRecorder::new(device.log());
        recorder.fail_submit(vk::Result::ERROR_DEVICE_LOST);
        let vertices = [0u8; 64];
        let uploads = [Upload::buffer(
            &vertices,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vertex_steady(),
        )];

        let result = upload(&device, &mut recorder, &uploads);

        assert!(matches!(result, Err(RenderError::DeviceLost { .. })));
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_memory(), 0);
    }

    #[test]
    fn test_payload_size_mismatch_is_rejected_before_creation() {
        let device = MockDevice::new(device_local_and_host_table());
        let mut recorder = MockRecorder::new(device.log());
        let pixels = [0u8; 10];
        let uploads = [Upload::image(
            ImageSpec::texture(4, 4, vk::Format::R8G8B8A8_UNORM),
            Some(&pixels),
            texture_steady(),
        )];
        assert!(matches!(
            upload(&device, &mut recorder, &uploads),
            Err(RenderError::InvalidUpload(_))
        ));
        assert!(device.events().is_empty());
    }
}
