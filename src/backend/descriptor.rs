// Descriptor sets - samplers, set layouts, the pool and the sets themselves
//
// Geometry   sampled image + sampler (one set per model texture plus the
//            default checker texture)
// Lighting   3 G-buffer input attachments, the shadow-map array through an
//            immutable comparison sampler, the light ring as a dynamic UBO
// Composite  the lit colour as an input attachment
//
// Input attachments point at size-dependent views, so they are rewritten
// after every resize. Everything else is written once at startup.

use ash::vk;

use super::render_graph::AttachmentKind;
use crate::error::{RenderError, RenderResult, VkResultExt};

const MAX_ANISOTROPY: f32 = 16.0;

/// Filtering used for the different kinds of textures
pub struct Samplers {
    /// Point sampling for the default checker texture
    pub nearest: vk::Sampler,
    /// Trilinear + anisotropic for model textures
    pub anisotropic: vk::Sampler,
    /// Depth comparison for shadow lookups
    pub shadow: vk::Sampler,
}

impl Samplers {
    pub fn new(device: &ash::Device, limits: &vk::PhysicalDeviceLimits) -> RenderResult<Self> {
        let anisotropy = MAX_ANISOTROPY.min(limits.max_sampler_anisotropy);

        let nearest_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::NEAREST)
            .min_filter(vk::Filter::NEAREST)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(100.0);

        let anisotropic_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(true)
            .max_anisotropy(anisotropy)
            .max_lod(vk::LOD_CLAMP_NONE);

        // Outside the map everything is lit: opaque white compares as depth 1
        let shadow_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE)
            .anisotropy_enable(true)
            .max_anisotropy(anisotropy)
            .compare_enable(true)
            .compare_op(vk::CompareOp::LESS_OR_EQUAL)
            .max_lod(0.0);

        unsafe {
            let nearest = device
                .create_sampler(&nearest_info, None)
                .op("vkCreateSampler")?;
            let anisotropic = match device.create_sampler(&anisotropic_info, None) {
                Ok(sampler) => sampler,
                Err(e) => {
                    device.destroy_sampler(nearest, None);
                    return Err(RenderError::from_vk("vkCreateSampler", e));
                }
            };
            let shadow = match device.create_sampler(&shadow_info, None) {
                Ok(sampler) => sampler,
                Err(e) => {
                    device.destroy_sampler(nearest, None);
                    device.destroy_sampler(anisotropic, None);
                    return Err(RenderError::from_vk("vkCreateSampler", e));
                }
            };
            Ok(Self {
                nearest,
                anisotropic,
                shadow,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_sampler(self.nearest, None);
            device.destroy_sampler(self.anisotropic, None);
            device.destroy_sampler(self.shadow, None);
        }
    }
}

/// One binding of a set layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingDesc {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
}

const fn binding(binding: u32, ty: vk::DescriptorType, count: u32) -> BindingDesc {
    BindingDesc { binding, ty, count }
}

pub const LIGHTING_GBUFFER_BINDING: u32 = 0;
pub const LIGHTING_SHADOW_BINDING: u32 = 3;
pub const LIGHTING_LIGHTS_BINDING: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorSetKind {
    Geometry,
    Lighting,
    Composite,
}

impl DescriptorSetKind {
    pub const ALL: [DescriptorSetKind; 3] = [
        DescriptorSetKind::Geometry,
        DescriptorSetKind::Lighting,
        DescriptorSetKind::Composite,
    ];

    /// Every binding is read by the fragment stage
    pub fn bindings(self) -> &'static [BindingDesc] {
        const GEOMETRY: [BindingDesc; 2] = [
            binding(0, vk::DescriptorType::SAMPLED_IMAGE, 1),
            binding(1, vk::DescriptorType::SAMPLER, 1),
        ];
        const LIGHTING: [BindingDesc; 3] = [
            binding(LIGHTING_GBUFFER_BINDING, vk::DescriptorType::INPUT_ATTACHMENT, 3),
            binding(LIGHTING_SHADOW_BINDING, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1),
            binding(LIGHTING_LIGHTS_BINDING, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, 1),
        ];
        const COMPOSITE: [BindingDesc; 1] = [binding(0, vk::DescriptorType::INPUT_ATTACHMENT, 1)];

        match self {
            Self::Geometry => &GEOMETRY,
            Self::Lighting => &LIGHTING,
            Self::Composite => &COMPOSITE,
        }
    }

    /// How many sets of this kind exist for a model with `texture_count` textures
    pub fn set_count(self, texture_count: u32) -> u32 {
        match self {
            // One per texture plus the default
            Self::Geometry => texture_count + 1,
            Self::Lighting | Self::Composite => 1,
        }
    }
}

/// Pool sizes covering every set of every kind
pub fn pool_sizes(texture_count: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for kind in DescriptorSetKind::ALL {
        let sets = kind.set_count(texture_count);
        for b in kind.bindings() {
            match sizes.iter_mut().find(|size| size.ty == b.ty) {
                Some(size) => size.descriptor_count += b.count * sets,
                None => sizes.push(vk::DescriptorPoolSize {
                    ty: b.ty,
                    descriptor_count: b.count * sets,
                }),
            }
        }
    }
    sizes
}

pub fn max_sets(texture_count: u32) -> u32 {
    DescriptorSetKind::ALL
        .iter()
        .map(|kind| kind.set_count(texture_count))
        .sum()
}

pub struct DescriptorLayouts {
    layouts: Vec<(DescriptorSetKind, vk::DescriptorSetLayout)>,
}

impl DescriptorLayouts {
    /// `shadow_sampler` is baked into the lighting layout
    pub fn new(device: &ash::Device, shadow_sampler: vk::Sampler) -> RenderResult<Self> {
        let immutable = [shadow_sampler];
        let mut layouts = Self {
            layouts: Vec::with_capacity(DescriptorSetKind::ALL.len()),
        };

        for kind in DescriptorSetKind::ALL {
            let bindings: Vec<vk::DescriptorSetLayoutBinding> = kind
                .bindings()
                .iter()
                .map(|b| {
                    let info = vk::DescriptorSetLayoutBinding::builder()
                        .binding(b.binding)
                        .descriptor_type(b.ty)
                        .descriptor_count(b.count)
                        .stage_flags(vk::ShaderStageFlags::FRAGMENT);
                    if b.ty == vk::DescriptorType::COMBINED_IMAGE_SAMPLER {
                        info.immutable_samplers(&immutable).build()
                    } else {
                        info.build()
                    }
                })
                .collect();
            let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

            match unsafe { device.create_descriptor_set_layout(&create_info, None) } {
                Ok(layout) => layouts.layouts.push((kind, layout)),
                Err(e) => {
                    layouts.destroy(device);
                    return Err(RenderError::from_vk("vkCreateDescriptorSetLayout", e));
                }
            }
        }
        Ok(layouts)
    }

    pub fn get(&self, kind: DescriptorSetKind) -> vk::DescriptorSetLayout {
        self.layouts
            .iter()
            .find(|(candidate, _)| *candidate == kind)
            .map_or(vk::DescriptorSetLayout::null(), |(_, layout)| *layout)
    }

    pub fn destroy(&self, device: &ash::Device) {
        for (_, layout) in &self.layouts {
            unsafe { device.destroy_descriptor_set_layout(*layout, None) };
        }
    }
}

/// The sets drawn with; freed all at once with the pool
pub struct DescriptorSets {
    pool: vk::DescriptorPool,
    /// Checker texture for objects without a texture of their own
    pub default_geometry: vk::DescriptorSet,
    /// Index `i` samples model texture `i`
    pub textures: Vec<vk::DescriptorSet>,
    pub lighting: vk::DescriptorSet,
    pub composite: vk::DescriptorSet,
}

impl DescriptorSets {
    pub fn allocate(
        device: &ash::Device,
        layouts: &DescriptorLayouts,
        texture_count: u32,
    ) -> RenderResult<Self> {
        let sizes = pool_sizes(texture_count);
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets(texture_count))
            .pool_sizes(&sizes);
        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .op("vkCreateDescriptorPool")?;

        let mut set_layouts = vec![
            layouts.get(DescriptorSetKind::Geometry),
            layouts.get(DescriptorSetKind::Lighting),
            layouts.get(DescriptorSetKind::Composite),
        ];
        let geometry_layout = layouts.get(DescriptorSetKind::Geometry);
        set_layouts.extend(std::iter::repeat(geometry_layout).take(texture_count as usize));
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);
        let sets = match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets,
            Err(e) => {
                unsafe { device.destroy_descriptor_pool(pool, None) };
                return Err(RenderError::from_vk("vkAllocateDescriptorSets", e));
            }
        };

        log::debug!("Allocated {} descriptor sets", sets.len());
        Ok(Self {
            pool,
            default_geometry: sets[0],
            lighting: sets[1],
            composite: sets[2],
            textures: sets[3..].to_vec(),
        })
    }

    /// Set used for an object's optional texture
    pub fn for_texture(&self, texture: Option<u32>) -> vk::DescriptorSet {
        texture
            .and_then(|index| self.textures.get(index as usize))
            .copied()
            .unwrap_or(self.default_geometry)
    }

    /// Point every geometry set at its texture; written once
    pub fn write_textures(
        &self,
        device: &ash::Device,
        samplers: &Samplers,
        default_view: vk::ImageView,
        texture_views: &[vk::ImageView],
    ) {
        let default_target = (self.default_geometry, default_view, samplers.nearest);
        let targets = std::iter::once(default_target).chain(
            self.textures
                .iter()
                .zip(texture_views)
                .map(|(&set, &view)| (set, view, samplers.anisotropic)),
        );

        for (set, view, sampler) in targets {
            let image_info = [vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }];
            let sampler_info = [vk::DescriptorImageInfo {
                sampler,
                image_view: vk::ImageView::null(),
                image_layout: vk::ImageLayout::UNDEFINED,
            }];
            let writes = [
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                    .image_info(&image_info)
                    .build(),
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(1)
                    .descriptor_type(vk::DescriptorType::SAMPLER)
                    .image_info(&sampler_info)
                    .build(),
            ];
            unsafe { device.update_descriptor_sets(&writes, &[]) };
        }
    }

    /// Shadow array and light ring; the ring is bound with a per-slot dynamic offset
    pub fn write_lighting_resources(
        &self,
        device: &ash::Device,
        shadow_array_view: vk::ImageView,
        light_buffer: vk::Buffer,
        light_block_size: u64,
    ) {
        let shadow_info = [vk::DescriptorImageInfo {
            // Immutable sampler from the layout
            sampler: vk::Sampler::null(),
            image_view: shadow_array_view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: light_buffer,
            offset: 0,
            range: light_block_size,
        }];
        let writes = [
            vk::WriteDescriptorSet::builder()
                .dst_set(self.lighting)
                .dst_binding(LIGHTING_SHADOW_BINDING)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&shadow_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(self.lighting)
                .dst_binding(LIGHTING_LIGHTS_BINDING)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .buffer_info(&buffer_info)
                .build(),
        ];
        unsafe { device.update_descriptor_sets(&writes, &[]) };
    }

    /// Rewrite the input attachments after the attachments were recreated
    pub fn write_input_attachments(
        &self,
        device: &ash::Device,
        view_for: impl Fn(AttachmentKind) -> Option<vk::ImageView>,
    ) -> RenderResult<()> {
        let input = |kind: AttachmentKind| {
            view_for(kind)
                .map(|view| vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                })
                .ok_or_else(|| RenderError::InvalidGraph(format!("no view for {kind:?}")))
        };

        let gbuffer = AttachmentKind::GBUFFER
            .iter()
            .map(|&kind| input(kind))
            .collect::<RenderResult<Vec<_>>>()?;
        let lit = [input(AttachmentKind::LitColor)?];

        let writes = [
            vk::WriteDescriptorSet::builder()
                .dst_set(self.lighting)
                .dst_binding(LIGHTING_GBUFFER_BINDING)
                .descriptor_type(vk::DescriptorType::INPUT_ATTACHMENT)
                .image_info(&gbuffer)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(self.composite)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::INPUT_ATTACHMENT)
                .image_info(&lit)
                .build(),
        ];
        unsafe { device.update_descriptor_sets(&writes, &[]) };
        Ok(())
    }

    pub fn destroy(&self, device: &ash::Device) {
        // Frees every set allocated from it
        unsafe { device.destroy_descriptor_pool(self.pool, None) };
    }
}
