// Graphics pipeline creation and management
//
// The graphics pipeline defines how vertices are processed and rasterized.
// It includes: vertex input, shaders, rasterization, depth/stencil, blending.
//
// Four pipelines exist, one per subpass. Viewport and scissor are baked in,
// so pipelines are rebuilt when the surface size changes; their layouts
// only depend on the descriptor layouts and are created once.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use std::ffi::CStr;

use super::descriptor::{DescriptorLayouts, DescriptorSetKind};
use super::render_graph::{RenderGraph, SubpassKind};
use super::shader::{ShaderId, ShaderLibrary};
use crate::error::{RenderError, RenderResult, VkResultExt};
use crate::scene::Vertex;

const ENTRY_POINT: &CStr = c"main";

/// Camera (or light) transform pushed before drawing a model
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TransformPush {
    pub view_proj: [f32; 16],
    pub view: [f32; 16],
}

impl TransformPush {
    pub fn new(view_proj: Mat4, view: Mat4) -> Self {
        Self {
            view_proj: view_proj.to_cols_array(),
            view: view.to_cols_array(),
        }
    }
}

/// Surface aspect ratio for the full-screen passes
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct AspectPush {
    pub aspect: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Shadow,
    Geometry,
    Lighting,
    Composite,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 4] = [
        PipelineKind::Shadow,
        PipelineKind::Geometry,
        PipelineKind::Lighting,
        PipelineKind::Composite,
    ];

    pub fn subpass(self) -> SubpassKind {
        match self {
            Self::Shadow => SubpassKind::ShadowDepth,
            Self::Geometry => SubpassKind::GBuffer,
            Self::Lighting => SubpassKind::Lighting,
            Self::Composite => SubpassKind::Composite,
        }
    }

    /// The shadow pass only writes depth, so it has no fragment shader
    pub fn shaders(self) -> &'static [ShaderId] {
        match self {
            Self::Shadow => &[ShaderId::ShadowVert],
            Self::Geometry => &[ShaderId::GBufferVert, ShaderId::GBufferFrag],
            Self::Lighting => &[ShaderId::FullscreenVert, ShaderId::LightingFrag],
            Self::Composite => &[ShaderId::FullscreenVert, ShaderId::CompositeFrag],
        }
    }

    /// Attributes read from the shared vertex buffer; full-screen passes have none
    pub fn vertex_attributes(self) -> Vec<vk::VertexInputAttributeDescription> {
        let attribute = |location, format, offset| vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format,
            offset,
        };
        let position = attribute(
            0,
            vk::Format::R32G32B32_SFLOAT,
            std::mem::offset_of!(Vertex, position) as u32,
        );
        match self {
            Self::Shadow => vec![position],
            Self::Geometry => vec![
                position,
                attribute(
                    1,
                    vk::Format::R32G32_SFLOAT,
                    std::mem::offset_of!(Vertex, texcoord) as u32,
                ),
                attribute(
                    2,
                    vk::Format::R32G32B32_SFLOAT,
                    std::mem::offset_of!(Vertex, normal) as u32,
                ),
            ],
            Self::Lighting | Self::Composite => Vec::new(),
        }
    }

    pub fn color_attachment_count(self) -> usize {
        self.subpass().color_attachments().len()
    }

    pub fn uses_depth(self) -> bool {
        self.subpass().depth_attachment().is_some()
    }

    pub fn cull_mode(self) -> vk::CullModeFlags {
        match self {
            // Both faces cast shadows
            Self::Shadow => vk::CullModeFlags::NONE,
            Self::Geometry => vk::CullModeFlags::BACK,
            // The full-screen triangle winds the other way
            Self::Lighting | Self::Composite => vk::CullModeFlags::FRONT,
        }
    }

    /// Constant and slope factors against shadow acne
    pub fn depth_bias(self) -> Option<(f32, f32)> {
        match self {
            Self::Shadow => Some((5.0, 1.5)),
            _ => None,
        }
    }

    pub fn push_constant_range(self) -> vk::PushConstantRange {
        match self {
            Self::Shadow | Self::Geometry => vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::VERTEX,
                offset: 0,
                size: std::mem::size_of::<TransformPush>() as u32,
            },
            Self::Lighting | Self::Composite => vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::FRAGMENT,
                offset: 0,
                size: std::mem::size_of::<AspectPush>() as u32,
            },
        }
    }

    pub fn descriptor_set(self) -> Option<DescriptorSetKind> {
        match self {
            Self::Shadow => None,
            Self::Geometry => Some(DescriptorSetKind::Geometry),
            Self::Lighting => Some(DescriptorSetKind::Lighting),
            Self::Composite => Some(DescriptorSetKind::Composite),
        }
    }
}

/// Pipeline layouts; independent of the surface size
pub struct PipelineLayouts {
    layouts: Vec<(PipelineKind, vk::PipelineLayout)>,
}

impl PipelineLayouts {
    pub fn new(device: &ash::Device, set_layouts: &DescriptorLayouts) -> RenderResult<Self> {
        let mut layouts = Self {
            layouts: Vec::with_capacity(PipelineKind::ALL.len()),
        };
        for kind in PipelineKind::ALL {
            let sets: Vec<vk::DescriptorSetLayout> =
                kind.descriptor_set().map(|set| set_layouts.get(set)).into_iter().collect();
            let push_constant_ranges = [kind.push_constant_range()];
            let layout_info = vk::PipelineLayoutCreateInfo::builder()
                .set_layouts(&sets)
                .push_constant_ranges(&push_constant_ranges);

            match unsafe { device.create_pipeline_layout(&layout_info, None) } {
                Ok(layout) => layouts.layouts.push((kind, layout)),
                Err(e) => {
                    layouts.destroy(device);
                    return Err(RenderError::from_vk("vkCreatePipelineLayout", e));
                }
            }
        }
        Ok(layouts)
    }

    pub fn get(&self, kind: PipelineKind) -> vk::PipelineLayout {
        self.layouts
            .iter()
            .find(|(candidate, _)| *candidate == kind)
            .map_or(vk::PipelineLayout::null(), |(_, layout)| *layout)
    }

    pub fn destroy(&self, device: &ash::Device) {
        for (_, layout) in &self.layouts {
            unsafe { device.destroy_pipeline_layout(*layout, None) };
        }
    }
}

/// Render pass, subpass and viewport a pipeline is built against
pub struct PipelineTarget<'a> {
    pub graph: &'a RenderGraph,
    pub render_pass: vk::RenderPass,
    pub extent: vk::Extent2D,
}

/// Create one graphics pipeline
pub fn create_graphics_pipeline(
    device: &ash::Device,
    kind: PipelineKind,
    layout: vk::PipelineLayout,
    shaders: &ShaderLibrary,
    target: &PipelineTarget,
) -> RenderResult<vk::Pipeline> {
    let subpass = target.graph.subpass_index(kind.subpass()).ok_or_else(|| {
        let message = format!("{:?} pipeline without a {:?} subpass", kind, kind.subpass());
        RenderError::InvalidGraph(message)
    })?;

    // Shader stages
    let shader_stages: Vec<vk::PipelineShaderStageCreateInfo> = kind
        .shaders()
        .iter()
        .map(|&id| {
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(id.stage())
                .module(shaders.module(id))
                .name(ENTRY_POINT)
                .build()
        })
        .collect();

    // Vertex input
    let attributes = kind.vertex_attributes();
    let bindings: Vec<vk::VertexInputBindingDescription> = if attributes.is_empty() {
        Vec::new()
    } else {
        vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    };
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    // Input assembly
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    // Viewport and scissor
    let viewport = vk::Viewport::builder()
        .x(0.0)
        .y(0.0)
        .width(target.extent.width as f32)
        .height(target.extent.height as f32)
        .min_depth(0.0)
        .max_depth(1.0)
        .build();

    let scissor = vk::Rect2D::builder()
        .offset(vk::Offset2D { x: 0, y: 0 })
        .extent(target.extent)
        .build();

    let viewports = &[viewport];
    let scissors = &[scissor];
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewports(viewports)
        .scissors(scissors);

    // Rasterization
    let (bias_constant, bias_slope) = kind.depth_bias().unwrap_or((0.0, 0.0));
    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(kind.cull_mode())
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(kind.depth_bias().is_some())
        .depth_bias_constant_factor(bias_constant)
        .depth_bias_slope_factor(bias_slope);

    // Multisampling (disabled)
    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(kind.uses_depth())
        .depth_write_enable(kind.uses_depth())
        .depth_compare_op(vk::CompareOp::LESS) // Closer objects win
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    // Color blending (no blending, opaque), one state per colour attachment
    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build();

    let color_blend_attachments = vec![color_blend_attachment; kind.color_attachment_count()];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .layout(layout)
        .render_pass(target.render_pass)
        .subpass(subpass)
        .build();

    let pipelines = unsafe {
        device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_, e)| e)
    }
    .op("vkCreateGraphicsPipelines")?;

    pipelines
        .into_iter()
        .next()
        .ok_or_else(|| RenderError::Capability("driver returned no pipeline".to_string()))
}

/// The four pipelines of one surface-size epoch
pub struct Pipelines {
    pipelines: Vec<(PipelineKind, vk::Pipeline)>,
}

impl Pipelines {
    pub fn new(
        device: &ash::Device,
        layouts: &PipelineLayouts,
        shaders: &ShaderLibrary,
        main: &PipelineTarget,
        shadow: &PipelineTarget,
    ) -> RenderResult<Self> {
        let mut pipelines = Self {
            pipelines: Vec::with_capacity(PipelineKind::ALL.len()),
        };
        for kind in PipelineKind::ALL {
            let target = if kind == PipelineKind::Shadow { shadow } else { main };
            match create_graphics_pipeline(device, kind, layouts.get(kind), shaders, target) {
                Ok(pipeline) => pipelines.pipelines.push((kind, pipeline)),
                Err(e) => {
                    pipelines.destroy(device);
                    return Err(e);
                }
            }
        }
        log::debug!(
            "Created {} pipelines for {}x{}",
            pipelines.pipelines.len(),
            main.extent.width,
            main.extent.height
        );
        Ok(pipelines)
    }

    pub fn get(&self, kind: PipelineKind) -> vk::Pipeline {
        self.pipelines
            .iter()
            .find(|(candidate, _)| *candidate == kind)
            .map_or(vk::Pipeline::null(), |(_, pipeline)| *pipeline)
    }

    pub fn destroy(&self, device: &ash::Device) {
        for (_, pipeline) in &self.pipelines {
            unsafe { device.destroy_pipeline(*pipeline, None) };
        }
    }
}
