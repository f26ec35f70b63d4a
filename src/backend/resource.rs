// GPU resources - buffers, images and the device calls that create them
//
// Resources never own memory themselves: they are bound into MemoryBlocks
// produced by the suballocator. ResourceDevice is the narrow set of device
// calls the staged transfer needs, so uploads can be exercised without a GPU.

use ash::vk;

use super::device::DeviceContext;
use super::memory::{
    suballocate, ByteRange, DeviceMemoryAllocator, MemoryBlock, MemoryRequirement, MemoryTypeTable,
};
use crate::error::{RenderError, RenderResult, VkResultExt};

/// Creation parameters of a 2D image (optionally layered and mipmapped)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSpec {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

impl ImageSpec {
    /// Sampled colour texture with a full mip chain
    pub fn texture(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            format,
            mip_levels: mip_levels_for(width, height),
            array_layers: 1,
            usage: vk::ImageUsageFlags::SAMPLED,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    /// Single-level render target
    pub fn attachment(
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Self {
        Self {
            width,
            height,
            format,
            mip_levels: 1,
            array_layers: 1,
            usage,
            aspect,
        }
    }

    pub fn with_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }

    pub fn extent(&self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.width,
            height: self.height,
            depth: 1,
        }
    }

    /// Bytes of a tightly packed level-0 upload covering every layer
    pub fn payload_size(&self) -> Option<u64> {
        texel_size(self.format).map(|texel| {
            self.width as u64 * self.height as u64 * self.array_layers as u64 * texel as u64
        })
    }
}

/// Number of levels down to 1x1: one plus the number of halvings
pub fn mip_levels_for(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Texel size of the formats the renderer uploads or renders into
pub fn texel_size(format: vk::Format) -> Option<u32> {
    match format {
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::D32_SFLOAT => Some(4),
        vk::Format::R16G16B16A16_SFLOAT => Some(8),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GpuBuffer {
    pub handle: vk::Buffer,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub access: vk::AccessFlags,
    pub region: ByteRange,
}

#[derive(Debug, Clone, Copy)]
pub struct GpuImage {
    pub handle: vk::Image,
    pub spec: ImageSpec,
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags,
    pub region: ByteRange,
}

/// A resource bound into a MemoryBlock at `region`
#[derive(Debug, Clone, Copy)]
pub enum GpuResource {
    Buffer(GpuBuffer),
    Image(GpuImage),
}

impl GpuResource {
    pub fn as_buffer(&self) -> Option<&GpuBuffer> {
        match self {
            Self::Buffer(buffer) => Some(buffer),
            Self::Image(_) => None,
        }
    }

    pub fn as_image(&self) -> Option<&GpuImage> {
        match self {
            Self::Image(image) => Some(image),
            Self::Buffer(_) => None,
        }
    }

    pub fn region(&self) -> ByteRange {
        match self {
            Self::Buffer(buffer) => buffer.region,
            Self::Image(image) => image.region,
        }
    }

    pub fn destroy<D: ResourceDevice + ?Sized>(&self, device: &D) {
        match self {
            Self::Buffer(buffer) => device.destroy_buffer(buffer.handle),
            Self::Image(image) => device.destroy_image(image.handle),
        }
    }
}

/// Device calls used to create, bind, fill and destroy resources
pub trait ResourceDevice: DeviceMemoryAllocator {
    fn memory_types(&self) -> &MemoryTypeTable;

    fn buffer_image_granularity(&self) -> u64;

    fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> Result<vk::Buffer, vk::Result>;

    fn create_image(&self, spec: &ImageSpec) -> Result<vk::Image, vk::Result>;

    fn buffer_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;

    fn image_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;

    fn bind_buffer(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), vk::Result>;

    fn bind_image(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), vk::Result>;

    /// Map `range` of host-visible memory, let `fill` write it, unmap
    fn write_memory(
        &self,
        memory: vk::DeviceMemory,
        range: ByteRange,
        fill: &mut dyn FnMut(&mut [u8]) -> RenderResult<()>,
    ) -> RenderResult<()>;

    fn destroy_buffer(&self, buffer: vk::Buffer);

    fn destroy_image(&self, image: vk::Image);
}

impl DeviceMemoryAllocator for DeviceContext {
    fn allocate_memory(
        &self,
        size: u64,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, vk::Result> {
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        unsafe { self.device.allocate_memory(&info, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }
}

impl ResourceDevice for DeviceContext {
    fn memory_types(&self) -> &MemoryTypeTable {
        &self.memory_types
    }

    fn buffer_image_granularity(&self) -> u64 {
        self.properties.limits.buffer_image_granularity
    }

    fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> Result<vk::Buffer, vk::Result> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        unsafe { self.device.create_buffer(&info, None) }
    }

    fn create_image(&self, spec: &ImageSpec) -> Result<vk::Image, vk::Result> {
        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(spec.format)
            .extent(spec.extent())
            .mip_levels(spec.mip_levels)
            .array_layers(spec.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(spec.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        unsafe { self.device.create_image(&info, None) }
    }

    fn buffer_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn image_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn bind_buffer(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), vk::Result> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }
    }

    fn bind_image(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), vk::Result> {
        unsafe { self.device.bind_image_memory(image, memory, offset) }
    }

    fn write_memory(
        &self,
        memory: vk::DeviceMemory,
        range: ByteRange,
        fill: &mut dyn FnMut(&mut [u8]) -> RenderResult<()>,
    ) -> RenderResult<()> {
        let len = usize::try_from(range.size)
            .map_err(|_| RenderError::InvalidUpload(format!("mapping of {} bytes", range.size)))?;
        let ptr = unsafe {
            self.device
                .map_memory(memory, range.offset, range.size, vk::MemoryMapFlags::empty())
        }
        .op("vkMapMemory")?;

        // Host-coherent memory: no flush needed before unmapping
        let bytes = unsafe { std::slice::from_raw_parts_mut(ptr.cast::<u8>(), len) };
        let result = fill(bytes);

        unsafe { self.device.unmap_memory(memory) };
        result
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) }
    }
}

/// View over layers `[base_layer, base_layer + layer_count)` and every mip level
pub fn create_image_view(
    device: &ash::Device,
    image: &GpuImage,
    view_type: vk::ImageViewType,
    base_layer: u32,
    layer_count: u32,
) -> RenderResult<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image.handle)
        .view_type(view_type)
        .format(image.spec.format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: image.spec.aspect,
            base_mip_level: 0,
            level_count: image.spec.mip_levels,
            base_array_layer: base_layer,
            layer_count,
        });

    unsafe { device.create_image_view(&create_info, None) }.op("vkCreateImageView")
}

/// Buffer in its own host-visible, coherent block, written directly by the CPU
#[derive(Debug)]
pub struct HostBuffer {
    pub buffer: GpuBuffer,
    memory: MemoryBlock,
}

impl HostBuffer {
    pub fn new<D: ResourceDevice + ?Sized>(
        device: &D,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> RenderResult<Self> {
        let handle = device.create_buffer(size, usage).op("vkCreateBuffer")?;
        let requirement = MemoryRequirement::buffer(device.buffer_requirements(handle));
        let memory = match suballocate(
            device,
            device.memory_types(),
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            &[requirement],
            device.buffer_image_granularity(),
        ) {
            Ok(memory) => memory,
            Err(e) => {
                device.destroy_buffer(handle);
                return Err(e);
            }
        };
        if let Err(e) = device.bind_buffer(handle, memory.handle(), 0) {
            device.destroy_buffer(handle);
            memory.free(device);
            return Err(RenderError::from_vk("vkBindBufferMemory", e));
        }

        Ok(Self {
            buffer: GpuBuffer {
                handle,
                size,
                usage,
                access: vk::AccessFlags::HOST_WRITE,
                region: ByteRange::new(0, size),
            },
            memory,
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle
    }

    /// Copy `data` to `offset`; the range must lie inside the buffer
    pub fn write<D: ResourceDevice + ?Sized>(
        &self,
        device: &D,
        offset: u64,
        data: &[u8],
    ) -> RenderResult<()> {
        let range = ByteRange::new(offset, data.len() as u64);
        if range.end() > self.buffer.size {
            return Err(RenderError::InvalidUpload(format!(
                "write of {} bytes at {} overruns a {} byte buffer",
                data.len(),
                offset,
                self.buffer.size
            )));
        }
        let mapped = ByteRange::new(self.buffer.region.offset + offset, range.size);
        device.write_memory(self.memory.handle(), mapped, &mut |bytes| {
            bytes.copy_from_slice(data);
            Ok(())
        })
    }

    pub fn destroy<D: ResourceDevice + ?Sized>(self, device: &D) {
        device.destroy_buffer(self.buffer.handle);
        self.memory.free(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mip_levels_count_halvings() {
        assert_eq!(mip_levels_for(1, 1), 1);
        assert_eq!(mip_levels_for(2, 1), 2);
        assert_eq!(mip_levels_for(256, 256), 9);
        assert_eq!(mip_levels_for(300, 17), 9);
        assert_eq!(mip_levels_for(4, 1024), 11);
    }

    #[test]
    fn test_payload_size() {
        let spec = ImageSpec::texture(4, 4, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(spec.payload_size(), Some(64));
        let layered = ImageSpec::attachment(
            8,
            8,
            vk::Format::D32_SFLOAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
        )
        .with_layers(3);
        assert_eq!(layered.payload_size(), Some(768));
        let odd = ImageSpec::texture(4, 4, vk::Format::BC1_RGB_UNORM_BLOCK);
        assert_eq!(odd.payload_size(), None);
    }

    #[test]
    fn test_host_buffer_lives_in_host_visible_memory() {
        use crate::testing::{device_local_and_host_table, Event, MockDevice};

        let device = MockDevice::new(device_local_and_host_table());
        let ring = HostBuffer::new(&device, 4096, vk::BufferUsageFlags::UNIFORM_BUFFER).unwrap();
        assert!(device
            .events()
            .iter()
            .any(|e| matches!(e, Event::Allocate { memory_type: 1, .. })));

        ring.write(&device, 2048, &[7u8; 16]).unwrap();
        assert_eq!(device.last_write(), vec![7u8; 16]);
        assert!(ring.write(&device, 4090, &[0u8; 16]).is_err());

        ring.destroy(&device);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_memory(), 0);
    }
}
