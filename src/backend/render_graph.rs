// Render graph - attachments, subpasses and the edges between them
//
// MAIN PASS (one per surface-size epoch):
//   attachments: [albedo, normal, position, lit colour, depth, surface]
//   GBuffer    writes albedo/normal/position + depth
//   Lighting   reads the G-buffer as input attachments, writes lit colour
//   Composite  reads lit colour, writes the surface image
//
// SHADOW PASS: one depth attachment, one subpass, recorded once per light
// into that light's layer of the shadow-map array.
//
// Subpasses name the attachments they use by kind; `build()` resolves the
// kinds to indices and refuses graphs where a subpass reads an input that
// an earlier subpass wrote without an edge ordering the two.

use ash::vk;

use crate::error::{RenderError, RenderResult, VkResultExt};

/// Every attachment the renderer knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentKind {
    GBufferAlbedo,
    GBufferNormal,
    GBufferPosition,
    LitColor,
    Depth,
    Surface,
    ShadowDepth,
}

impl AttachmentKind {
    /// Main pass attachments in framebuffer order
    pub const MAIN: [AttachmentKind; 6] = [
        AttachmentKind::GBufferAlbedo,
        AttachmentKind::GBufferNormal,
        AttachmentKind::GBufferPosition,
        AttachmentKind::LitColor,
        AttachmentKind::Depth,
        AttachmentKind::Surface,
    ];

    pub const GBUFFER: [AttachmentKind; 3] = [
        AttachmentKind::GBufferAlbedo,
        AttachmentKind::GBufferNormal,
        AttachmentKind::GBufferPosition,
    ];

    /// Attachments the renderer allocates per surface size (everything but the surface)
    pub const TRANSIENT: [AttachmentKind; 5] = [
        AttachmentKind::GBufferAlbedo,
        AttachmentKind::GBufferNormal,
        AttachmentKind::GBufferPosition,
        AttachmentKind::LitColor,
        AttachmentKind::Depth,
    ];

    /// Fixed format; the surface takes whatever the swapchain was created with
    pub fn format(self, surface_format: vk::Format) -> vk::Format {
        match self {
            Self::GBufferAlbedo | Self::GBufferNormal | Self::GBufferPosition => {
                vk::Format::R32G32B32A32_SFLOAT
            }
            Self::LitColor => vk::Format::R8G8B8A8_SRGB,
            Self::Depth | Self::ShadowDepth => vk::Format::D32_SFLOAT,
            Self::Surface => surface_format,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth | Self::ShadowDepth)
    }

    pub fn aspect(self) -> vk::ImageAspectFlags {
        if self.is_depth() {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        }
    }

    pub fn usage(self) -> vk::ImageUsageFlags {
        match self {
            Self::GBufferAlbedo | Self::GBufferNormal | Self::GBufferPosition | Self::LitColor => {
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::INPUT_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT
            }
            Self::Depth => {
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT
            }
            Self::Surface => vk::ImageUsageFlags::COLOR_ATTACHMENT,
            Self::ShadowDepth => {
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED
            }
        }
    }

    /// Layout the attachment is in outside its render pass
    pub fn resting_layout(self) -> vk::ImageLayout {
        match self {
            Self::GBufferAlbedo | Self::GBufferNormal | Self::GBufferPosition | Self::LitColor => {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            }
            Self::Depth => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            Self::Surface => vk::ImageLayout::PRESENT_SRC_KHR,
            Self::ShadowDepth => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    pub fn describe(self, surface_format: vk::Format) -> AttachmentDesc {
        let (load_op, store_op, initial_layout) = match self {
            // Contents only live inside one pass
            Self::GBufferAlbedo
            | Self::GBufferNormal
            | Self::GBufferPosition
            | Self::LitColor
            | Self::Depth => (
                vk::AttachmentLoadOp::CLEAR,
                vk::AttachmentStoreOp::DONT_CARE,
                self.resting_layout(),
            ),
            // Fully overwritten by the composite subpass
            Self::Surface => (
                vk::AttachmentLoadOp::DONT_CARE,
                vk::AttachmentStoreOp::STORE,
                vk::ImageLayout::UNDEFINED,
            ),
            Self::ShadowDepth => (
                vk::AttachmentLoadOp::CLEAR,
                vk::AttachmentStoreOp::STORE,
                self.resting_layout(),
            ),
        };
        AttachmentDesc {
            kind: self,
            format: self.format(surface_format),
            load_op,
            store_op,
            initial_layout,
            final_layout: self.resting_layout(),
        }
    }

    pub fn clear_value(self) -> vk::ClearValue {
        if self.is_depth() {
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            }
        } else {
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 0.0],
                },
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentDesc {
    pub kind: AttachmentKind,
    pub format: vk::Format,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubpassKind {
    GBuffer,
    Lighting,
    Composite,
    ShadowDepth,
}

impl SubpassKind {
    pub const MAIN: [SubpassKind; 3] = [
        SubpassKind::GBuffer,
        SubpassKind::Lighting,
        SubpassKind::Composite,
    ];

    pub fn color_attachments(self) -> &'static [AttachmentKind] {
        match self {
            Self::GBuffer => &AttachmentKind::GBUFFER,
            Self::Lighting => &[AttachmentKind::LitColor],
            Self::Composite => &[AttachmentKind::Surface],
            Self::ShadowDepth => &[],
        }
    }

    pub fn input_attachments(self) -> &'static [AttachmentKind] {
        match self {
            Self::Lighting => &AttachmentKind::GBUFFER,
            Self::Composite => &[AttachmentKind::LitColor],
            Self::GBuffer | Self::ShadowDepth => &[],
        }
    }

    pub fn depth_attachment(self) -> Option<AttachmentKind> {
        match self {
            Self::GBuffer => Some(AttachmentKind::Depth),
            Self::ShadowDepth => Some(AttachmentKind::ShadowDepth),
            Self::Lighting | Self::Composite => None,
        }
    }

    fn writes(self, attachment: AttachmentKind) -> bool {
        self.color_attachments().contains(&attachment)
            || self.depth_attachment() == Some(attachment)
    }
}

/// Endpoint of a dependency edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubpassSlot {
    External,
    Subpass(SubpassKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyEdge {
    pub src: SubpassSlot,
    pub dst: SubpassSlot,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub by_region: bool,
}

impl DependencyEdge {
    /// Colour writes of `src` complete before `dst` reads them as input attachments
    pub fn color_to_input(src: SubpassKind, dst: SubpassKind) -> Self {
        Self {
            src: SubpassSlot::Subpass(src),
            dst: SubpassSlot::Subpass(dst),
            src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access: vk::AccessFlags::INPUT_ATTACHMENT_READ,
            by_region: true,
        }
    }

    fn covers_input_read(&self, writer_is_depth: bool) -> bool {
        let write = if writer_is_depth {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        } else {
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        };
        self.src_access.contains(write)
            && self.dst_access.contains(vk::AccessFlags::INPUT_ATTACHMENT_READ)
            && self.dst_stage.contains(vk::PipelineStageFlags::FRAGMENT_SHADER)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentRef {
    pub index: u32,
    pub layout: vk::ImageLayout,
}

impl AttachmentRef {
    fn raw(self) -> vk::AttachmentReference {
        vk::AttachmentReference {
            attachment: self.index,
            layout: self.layout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubpassDesc {
    pub kind: SubpassKind,
    pub colors: Vec<AttachmentRef>,
    pub inputs: Vec<AttachmentRef>,
    pub depth: Option<AttachmentRef>,
}

/// Collects attachments, subpasses and edges; `build` validates them
#[derive(Debug, Default, Clone)]
pub struct RenderGraphBuilder {
    attachments: Vec<AttachmentDesc>,
    subpasses: Vec<SubpassKind>,
    edges: Vec<DependencyEdge>,
}

impl RenderGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attachment(mut self, desc: AttachmentDesc) -> Self {
        self.attachments.push(desc);
        self
    }

    pub fn subpass(mut self, kind: SubpassKind) -> Self {
        self.subpasses.push(kind);
        self
    }

    pub fn edge(mut self, edge: DependencyEdge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn build(self) -> RenderResult<RenderGraph> {
        for (i, desc) in self.attachments.iter().enumerate() {
            if self.attachments[..i].iter().any(|d| d.kind == desc.kind) {
                return Err(RenderError::InvalidGraph(format!(
                    "attachment {:?} listed twice",
                    desc.kind
                )));
            }
        }
        for (i, kind) in self.subpasses.iter().enumerate() {
            if self.subpasses[..i].contains(kind) {
                return Err(RenderError::InvalidGraph(format!("subpass {kind:?} listed twice")));
            }
        }
        if self.subpasses.is_empty() {
            return Err(RenderError::InvalidGraph("render pass without subpasses".to_string()));
        }

        let resolve = |kind: AttachmentKind, layout: vk::ImageLayout| {
            self.attachments
                .iter()
                .position(|d| d.kind == kind)
                .map(|index| AttachmentRef {
                    index: index as u32,
                    layout,
                })
                .ok_or_else(|| {
                    RenderError::InvalidGraph(format!("no attachment {kind:?} in graph"))
                })
        };

        let mut subpasses = Vec::with_capacity(self.subpasses.len());
        for &kind in &self.subpasses {
            let colors = kind
                .color_attachments()
                .iter()
                .map(|&a| resolve(a, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL))
                .collect::<RenderResult<Vec<_>>>()?;
            let inputs = kind
                .input_attachments()
                .iter()
                .map(|&a| resolve(a, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL))
                .collect::<RenderResult<Vec<_>>>()?;
            let depth = kind
                .depth_attachment()
                .map(|a| resolve(a, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL))
                .transpose()?;
            subpasses.push(SubpassDesc {
                kind,
                colors,
                inputs,
                depth,
            });
        }

        let graph = RenderGraph {
            attachments: self.attachments,
            subpasses,
            edges: self.edges,
        };
        graph.validate_edges()?;
        Ok(graph)
    }
}

/// A validated render pass description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderGraph {
    attachments: Vec<AttachmentDesc>,
    subpasses: Vec<SubpassDesc>,
    edges: Vec<DependencyEdge>,
}

impl RenderGraph {
    /// G-buffer, lighting and composite subpasses over six attachments
    pub fn deferred(surface_format: vk::Format) -> RenderResult<Self> {
        let mut builder = RenderGraphBuilder::new();
        for kind in AttachmentKind::MAIN {
            builder = builder.attachment(kind.describe(surface_format));
        }
        for kind in SubpassKind::MAIN {
            builder = builder.subpass(kind);
        }

        builder
            // Last frame's lighting/composite reads of the shared attachments
            // finish before this frame clears them
            .edge(DependencyEdge {
                src: SubpassSlot::External,
                dst: SubpassSlot::Subpass(SubpassKind::GBuffer),
                src_stage: vk::PipelineStageFlags::FRAGMENT_SHADER
                    | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                dst_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                dst_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                by_region: false,
            })
            // Shadow maps written earlier in the command buffer
            .edge(DependencyEdge {
                src: SubpassSlot::External,
                dst: SubpassSlot::Subpass(SubpassKind::Lighting),
                src_stage: vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
                src_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                by_region: false,
            })
            .edge(DependencyEdge::color_to_input(SubpassKind::GBuffer, SubpassKind::Lighting))
            .edge(DependencyEdge::color_to_input(SubpassKind::Lighting, SubpassKind::Composite))
            // The surface leaves UNDEFINED only after the acquire semaphore,
            // which the submission waits on at COLOR_ATTACHMENT_OUTPUT
            .edge(DependencyEdge {
                src: SubpassSlot::External,
                dst: SubpassSlot::Subpass(SubpassKind::Composite),
                src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                dst_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                by_region: false,
            })
            .edge(DependencyEdge {
                src: SubpassSlot::Subpass(SubpassKind::Composite),
                dst: SubpassSlot::External,
                src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                dst_access: vk::AccessFlags::empty(),
                by_region: false,
            })
            .build()
    }

    /// Depth-only pass rendering one light's shadow map
    pub fn shadow() -> RenderResult<Self> {
        RenderGraphBuilder::new()
            .attachment(AttachmentKind::ShadowDepth.describe(vk::Format::UNDEFINED))
            .subpass(SubpassKind::ShadowDepth)
            // Previous frame's lighting sampled this layer
            .edge(DependencyEdge {
                src: SubpassSlot::External,
                dst: SubpassSlot::Subpass(SubpassKind::ShadowDepth),
                src_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
                dst_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                by_region: false,
            })
            // Depth writes visible to the lighting subpass' sampling
            .edge(DependencyEdge {
                src: SubpassSlot::Subpass(SubpassKind::ShadowDepth),
                dst: SubpassSlot::External,
                src_stage: vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
                src_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                by_region: false,
            })
            .build()
    }

    pub fn attachments(&self) -> &[AttachmentDesc] {
        &self.attachments
    }

    pub fn subpasses(&self) -> &[SubpassDesc] {
        &self.subpasses
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn subpass_index(&self, kind: SubpassKind) -> Option<u32> {
        self.subpasses
            .iter()
            .position(|s| s.kind == kind)
            .map(|i| i as u32)
    }

    #[cfg(test)]
    pub fn attachment_index(&self, kind: AttachmentKind) -> Option<u32> {
        self.attachments
            .iter()
            .position(|a| a.kind == kind)
            .map(|i| i as u32)
    }

    fn slot_index(&self, slot: SubpassSlot) -> RenderResult<u32> {
        match slot {
            SubpassSlot::External => Ok(vk::SUBPASS_EXTERNAL),
            SubpassSlot::Subpass(kind) => self.subpass_index(kind).ok_or_else(|| {
                RenderError::InvalidGraph(format!("edge names missing subpass {kind:?}"))
            }),
        }
    }

    fn validate_edges(&self) -> RenderResult<()> {
        for edge in &self.edges {
            let src = self.slot_index(edge.src)?;
            let dst = self.slot_index(edge.dst)?;
            if src == vk::SUBPASS_EXTERNAL && dst == vk::SUBPASS_EXTERNAL {
                return Err(RenderError::InvalidGraph(
                    "edge between two external slots".to_string(),
                ));
            }
            if src != vk::SUBPASS_EXTERNAL && dst != vk::SUBPASS_EXTERNAL && src >= dst {
                return Err(RenderError::InvalidGraph(format!(
                    "edge {:?} -> {:?} does not point forward",
                    edge.src, edge.dst
                )));
            }
        }

        // Every input read needs an edge from the subpass that last wrote it
        for (reader_index, reader) in self.subpasses.iter().enumerate() {
            for &input in reader.kind.input_attachments() {
                let Some(writer) = self.subpasses[..reader_index]
                    .iter()
                    .rev()
                    .find(|s| s.kind.writes(input))
                else {
                    continue;
                };
                let covered = self.edges.iter().any(|edge| {
                    edge.src == SubpassSlot::Subpass(writer.kind)
                        && edge.dst == SubpassSlot::Subpass(reader.kind)
                        && edge.covers_input_read(input.is_depth())
                });
                if !covered {
                    return Err(RenderError::InvalidGraph(format!(
                        "{:?} reads {:?} written by {:?} without a dependency",
                        reader.kind, input, writer.kind
                    )));
                }
            }
        }
        Ok(())
    }

    /// Edges with their subpass slots resolved to indices
    pub fn dependencies(&self) -> Vec<vk::SubpassDependency> {
        self.edges
            .iter()
            .filter_map(|edge| {
                let src = self.slot_index(edge.src).ok()?;
                let dst = self.slot_index(edge.dst).ok()?;
                Some(vk::SubpassDependency {
                    src_subpass: src,
                    dst_subpass: dst,
                    src_stage_mask: edge.src_stage,
                    dst_stage_mask: edge.dst_stage,
                    src_access_mask: edge.src_access,
                    dst_access_mask: edge.dst_access,
                    dependency_flags: if edge.by_region {
                        vk::DependencyFlags::BY_REGION
                    } else {
                        vk::DependencyFlags::empty()
                    },
                })
            })
            .collect()
    }

    /// One clear value per attachment, in attachment order
    pub fn clear_values(&self) -> Vec<vk::ClearValue> {
        self.attachments.iter().map(|a| a.kind.clear_value()).collect()
    }

    pub fn create_render_pass(&self, device: &ash::Device) -> RenderResult<vk::RenderPass> {
        let attachments: Vec<vk::AttachmentDescription> = self
            .attachments
            .iter()
            .map(|a| {
                vk::AttachmentDescription::builder()
                    .format(a.format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(a.load_op)
                    .store_op(a.store_op)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(a.initial_layout)
                    .final_layout(a.final_layout)
                    .build()
            })
            .collect();

        // Reference arrays must outlive the subpass descriptions pointing at them
        let colors: Vec<Vec<vk::AttachmentReference>> = self
            .subpasses
            .iter()
            .map(|s| s.colors.iter().map(|r| r.raw()).collect())
            .collect();
        let inputs: Vec<Vec<vk::AttachmentReference>> = self
            .subpasses
            .iter()
            .map(|s| s.inputs.iter().map(|r| r.raw()).collect())
            .collect();
        let depths: Vec<Option<vk::AttachmentReference>> =
            self.subpasses.iter().map(|s| s.depth.map(AttachmentRef::raw)).collect();

        let subpasses: Vec<vk::SubpassDescription> = (0..self.subpasses.len())
            .map(|i| {
                let mut subpass = vk::SubpassDescription::builder()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .color_attachments(&colors[i])
                    .input_attachments(&inputs[i]);
                if let Some(depth) = &depths[i] {
                    subpass = subpass.depth_stencil_attachment(depth);
                }
                subpass.build()
            })
            .collect();

        let dependencies = self.dependencies();
        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        unsafe { device.create_render_pass(&render_pass_info, None) }.op("vkCreateRenderPass")
    }

    /// Framebuffer whose views are looked up by attachment kind
    pub fn create_framebuffer(
        &self,
        device: &ash::Device,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
        view_for: impl Fn(AttachmentKind) -> Option<vk::ImageView>,
    ) -> RenderResult<vk::Framebuffer> {
        let views = self
            .attachments
            .iter()
            .map(|a| {
                view_for(a.kind).ok_or_else(|| {
                    RenderError::InvalidGraph(format!("no view bound for {:?}", a.kind))
                })
            })
            .collect::<RenderResult<Vec<_>>>()?;

        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        unsafe { device.create_framebuffer(&framebuffer_info, None) }.op("vkCreateFramebuffer")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SURFACE: vk::Format = vk::Format::B8G8R8A8_SRGB;

    fn main_builder() -> RenderGraphBuilder {
        let mut builder = RenderGraphBuilder::new();
        for kind in AttachmentKind::MAIN {
            builder = builder.attachment(kind.describe(SURFACE));
        }
        for kind in SubpassKind::MAIN {
            builder = builder.subpass(kind);
        }
        builder
    }

    #[test]
    fn test_deferred_graph_layout() {
        let graph = RenderGraph::deferred(SURFACE).unwrap();
        let kinds: Vec<_> = graph.attachments().iter().map(|a| a.kind).collect();
        assert_eq!(kinds, AttachmentKind::MAIN.to_vec());
        assert_eq!(graph.attachments()[5].format, SURFACE);
        assert_eq!(graph.attachments()[5].initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(graph.attachments()[5].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);

        let [gbuffer, lighting, composite] = graph.subpasses() else {
            panic!("expected three subpasses");
        };
        let indices = |refs: &[AttachmentRef]| refs.iter().map(|r| r.index).collect::<Vec<_>>();

        assert_eq!(indices(&gbuffer.colors), vec![0, 1, 2]);
        assert_eq!(gbuffer.depth.map(|d| d.index), Some(4));
        assert!(gbuffer.inputs.is_empty());

        assert_eq!(indices(&lighting.inputs), vec![0, 1, 2]);
        assert!(lighting
            .inputs
            .iter()
            .all(|r| r.layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));
        assert_eq!(indices(&lighting.colors), vec![3]);
        assert_eq!(lighting.depth, None);

        assert_eq!(indices(&composite.inputs), vec![3]);
        assert_eq!(indices(&composite.colors), vec![5]);
    }

    #[test]
    fn test_subpass_edges_are_by_region_input_reads() {
        let graph = RenderGraph::deferred(SURFACE).unwrap();
        let internal: Vec<_> = graph
            .dependencies()
            .into_iter()
            .filter(|d| {
                d.src_subpass != vk::SUBPASS_EXTERNAL && d.dst_subpass != vk::SUBPASS_EXTERNAL
            })
            .collect();
        assert_eq!(internal.len(), 2);
        assert_eq!((internal[0].src_subpass, internal[0].dst_subpass), (0, 1));
        assert_eq!((internal[1].src_subpass, internal[1].dst_subpass), (1, 2));
        for dep in internal {
            assert_eq!(dep.src_stage_mask, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
            assert_eq!(dep.src_access_mask, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
            assert_eq!(dep.dst_stage_mask, vk::PipelineStageFlags::FRAGMENT_SHADER);
            assert_eq!(dep.dst_access_mask, vk::AccessFlags::INPUT_ATTACHMENT_READ);
            assert_eq!(dep.dependency_flags, vk::DependencyFlags::BY_REGION);
        }
    }

    #[test]
    fn test_missing_input_edge_is_rejected() {
        let result = main_builder()
            .edge(DependencyEdge::color_to_input(SubpassKind::GBuffer, SubpassKind::Lighting))
            .build();
        assert!(matches!(result, Err(RenderError::InvalidGraph(_))));

        let complete = main_builder()
            .edge(DependencyEdge::color_to_input(SubpassKind::GBuffer, SubpassKind::Lighting))
            .edge(DependencyEdge::color_to_input(SubpassKind::Lighting, SubpassKind::Composite))
            .build();
        assert!(complete.is_ok());
    }

    #[test]
    fn test_edge_without_input_read_does_not_count() {
        let mut weak =
            DependencyEdge::color_to_input(SubpassKind::Lighting, SubpassKind::Composite);
        weak.dst_access = vk::AccessFlags::COLOR_ATTACHMENT_READ;
        let result = main_builder()
            .edge(DependencyEdge::color_to_input(SubpassKind::GBuffer, SubpassKind::Lighting))
            .edge(weak)
            .build();
        assert!(matches!(result, Err(RenderError::InvalidGraph(_))));
    }

    #[test]
    fn test_unresolvable_attachment_is_rejected() {
        let result = RenderGraphBuilder::new()
            .attachment(AttachmentKind::GBufferAlbedo.describe(SURFACE))
            .subpass(SubpassKind::GBuffer)
            .build();
        assert!(matches!(result, Err(RenderError::InvalidGraph(_))));
    }

    #[test]
    fn test_backward_or_dangling_edges_are_rejected() {
        let backward = main_builder()
            .edge(DependencyEdge::color_to_input(SubpassKind::GBuffer, SubpassKind::Lighting))
            .edge(DependencyEdge::color_to_input(SubpassKind::Lighting, SubpassKind::Composite))
            .edge(DependencyEdge::color_to_input(SubpassKind::Composite, SubpassKind::GBuffer))
            .build();
        assert!(matches!(backward, Err(RenderError::InvalidGraph(_))));

        let dangling = RenderGraphBuilder::new()
            .attachment(AttachmentKind::ShadowDepth.describe(SURFACE))
            .subpass(SubpassKind::ShadowDepth)
            .edge(DependencyEdge::color_to_input(SubpassKind::ShadowDepth, SubpassKind::Lighting))
            .build();
        assert!(matches!(dangling, Err(RenderError::InvalidGraph(_))));
    }

    #[test]
    fn test_shadow_graph() {
        let graph = RenderGraph::shadow().unwrap();
        assert_eq!(graph.attachments().len(), 1);
        let depth = graph.attachments()[0];
        assert_eq!(depth.format, vk::Format::D32_SFLOAT);
        assert_eq!(depth.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(depth.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(depth.initial_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(depth.final_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        assert_eq!(graph.subpasses().len(), 1);
        assert!(graph.subpasses()[0].colors.is_empty());

        let deps = graph.dependencies();
        assert!(deps.iter().all(|d| {
            d.src_subpass == vk::SUBPASS_EXTERNAL || d.dst_subpass == vk::SUBPASS_EXTERNAL
        }));
        let exit = deps
            .iter()
            .find(|d| d.dst_subpass == vk::SUBPASS_EXTERNAL)
            .unwrap();
        assert!(exit.src_access_mask.contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
        assert!(exit.dst_access_mask.contains(vk::AccessFlags::SHADER_READ));
        assert!(exit.dst_stage_mask.contains(vk::PipelineStageFlags::FRAGMENT_SHADER));
    }

    #[test]
    fn test_clear_values_follow_attachment_order() {
        let graph = RenderGraph::deferred(SURFACE).unwrap();
        let clears = graph.clear_values();
        assert_eq!(clears.len(), 6);
        let depth = graph.attachment_index(AttachmentKind::Depth).unwrap() as usize;
        assert_eq!(unsafe { clears[depth].depth_stencil.depth }, 1.0);
    }
}
