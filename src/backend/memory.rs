// Suballocating memory allocator
//
// One vkAllocateMemory call backs a whole set of resources. The caller hands
// over every resource's requirements, gets back a single MemoryBlock and one
// aligned, disjoint ByteRange per resource, in request order.

use ash::vk;

use crate::error::{RenderError, RenderResult};

/// Properties of one entry of the device's memory-type table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub property_flags: vk::MemoryPropertyFlags,
    pub heap_index: u32,
    pub heap_size: u64,
}

/// Memory types in the device's own enumeration order
#[derive(Debug, Clone, Default)]
pub struct MemoryTypeTable {
    types: Vec<MemoryType>,
}

impl MemoryTypeTable {
    pub fn new(types: Vec<MemoryType>) -> Self {
        Self { types }
    }

    pub fn from_properties(properties: &vk::PhysicalDeviceMemoryProperties) -> Self {
        let types = properties.memory_types[..properties.memory_type_count as usize]
            .iter()
            .map(|ty| MemoryType {
                property_flags: ty.property_flags,
                heap_index: ty.heap_index,
                heap_size: properties.memory_heaps[ty.heap_index as usize].size,
            })
            .collect();
        Self { types }
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn get(&self, index: u32) -> Option<&MemoryType> {
        self.types.get(index as usize)
    }

    /// Bitmask with one bit set per existing memory type
    fn valid_bits(&self) -> u32 {
        if self.types.len() >= 32 {
            u32::MAX
        } else {
            (1u32 << self.types.len()) - 1
        }
    }
}

/// A byte window inside a MemoryBlock or a staging buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteRange {
    pub offset: u64,
    pub size: u64,
}

impl ByteRange {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    #[cfg(test)]
    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Borrow this range out of a host mapping of `bytes.len()` bytes
    pub fn slice_mut<'a>(&self, bytes: &'a mut [u8]) -> RenderResult<&'a mut [u8]> {
        let start = usize::try_from(self.offset).ok();
        let end = usize::try_from(self.end()).ok();
        match (start, end) {
            (Some(start), Some(end)) if end <= bytes.len() => Ok(&mut bytes[start..end]),
            _ => Err(RenderError::InvalidUpload(format!(
                "range {}..{} outside mapping of {} bytes",
                self.offset,
                self.end(),
                bytes.len()
            ))),
        }
    }
}

/// Memory requirement of one resource in an allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirement {
    pub size: u64,
    pub alignment: u64,
    pub type_bits: u32,
    /// Buffers and linear images; optimal-tiling images are non-linear
    pub linear: bool,
}

impl MemoryRequirement {
    pub fn buffer(requirements: vk::MemoryRequirements) -> Self {
        Self {
            size: requirements.size,
            alignment: requirements.alignment,
            type_bits: requirements.memory_type_bits,
            linear: true,
        }
    }

    pub fn image(requirements: vk::MemoryRequirements) -> Self {
        Self {
            size: requirements.size,
            alignment: requirements.alignment,
            type_bits: requirements.memory_type_bits,
            linear: false,
        }
    }
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    value.div_ceil(alignment) * alignment
}

/// Offsets for a set of resources packed in request order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationLayout {
    pub regions: Vec<ByteRange>,
    pub size: u64,
}

/// Pack resources back to back, honouring each alignment. Neighbours of
/// different linearity are additionally separated by `granularity`
/// (bufferImageGranularity).
pub fn plan_layout(requirements: &[MemoryRequirement], granularity: u64) -> AllocationLayout {
    let mut regions = Vec::with_capacity(requirements.len());
    let mut running = 0u64;
    let mut previous_linear = None;

    for req in requirements {
        let mut alignment = req.alignment.max(1);
        if previous_linear.is_some_and(|linear| linear != req.linear) {
            alignment = alignment.max(granularity);
        }
        let offset = align_up(running, alignment);
        regions.push(ByteRange::new(offset, req.size));
        running = offset + req.size;
        previous_linear = Some(req.linear);
    }

    AllocationLayout {
        regions,
        size: running,
    }
}

/// The single call the allocator makes into the device
pub trait DeviceMemoryAllocator {
    fn allocate_memory(
        &self,
        size: u64,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, vk::Result>;

    fn free_memory(&self, memory: vk::DeviceMemory);
}

/// One device allocation shared by several resources
#[derive(Debug)]
pub struct MemoryBlock {
    memory: vk::DeviceMemory,
    size: u64,
    memory_type_index: u32,
    regions: Vec<ByteRange>,
}

impl MemoryBlock {
    pub fn handle(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn regions(&self) -> &[ByteRange] {
        &self.regions
    }

    pub fn region(&self, index: usize) -> RenderResult<ByteRange> {
        self.regions.get(index).copied().ok_or_else(|| {
            RenderError::InvalidUpload(format!(
                "block has {} regions, asked for {}",
                self.regions.len(),
                index
            ))
        })
    }

    /// Return the allocation; every resource bound into it must be gone
    pub fn free<A: DeviceMemoryAllocator + ?Sized>(self, allocator: &A) {
        allocator.free_memory(self.memory);
    }
}

/// Allocate one block able to back every resource in `requirements`.
///
/// Memory types are tried in ascending index order. A type qualifies when
/// every resource accepts it, its flags contain `required` and its heap is
/// large enough for the packed total. The first successful allocation wins.
pub fn suballocate<A: DeviceMemoryAllocator + ?Sized>(
    allocator: &A,
    table: &MemoryTypeTable,
    required: vk::MemoryPropertyFlags,
    requirements: &[MemoryRequirement],
    granularity: u64,
) -> RenderResult<MemoryBlock> {
    if requirements.is_empty() {
        return Err(RenderError::InvalidUpload(
            "allocation request without resources".to_string(),
        ));
    }

    let type_bits = requirements
        .iter()
        .fold(table.valid_bits(), |bits, req| bits & req.type_bits);
    if type_bits == 0 {
        return Err(RenderError::IncompatibleResourceSet {
            type_bits,
            required,
        });
    }

    let layout = plan_layout(requirements, granularity);

    let mut matching = 0u32;
    let mut attempts = 0u32;
    for index in 0..table.len() as u32 {
        if type_bits & (1 << index) == 0 {
            continue;
        }
        let Some(ty) = table.get(index) else { continue };
        if !ty.property_flags.contains(required) {
            continue;
        }
        matching += 1;
        if ty.heap_size < layout.size {
            log::debug!(
                "Memory type {} skipped: heap of {} bytes < {} requested",
                index,
                ty.heap_size,
                layout.size
            );
            continue;
        }

        attempts += 1;
        match allocator.allocate_memory(layout.size, index) {
            Ok(memory) => {
                log::debug!(
                    "Suballocated {} resources in {} bytes of memory type {}",
                    requirements.len(),
                    layout.size,
                    index
                );
                return Ok(MemoryBlock {
                    memory,
                    size: layout.size,
                    memory_type_index: index,
                    regions: layout.regions,
                });
            }
            Err(e) => {
                log::warn!(
                    "Allocation of {} bytes from memory type {} failed: {:?}",
                    layout.size,
                    index,
                    e
                );
            }
        }
    }

    if matching == 0 {
        return Err(RenderError::IncompatibleResourceSet {
            type_bits,
            required,
        });
    }

    Err(RenderError::AllocationExhausted {
        size: layout.size,
        attempts,
    })
}
