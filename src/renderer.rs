// =============================================================================
// RENDERER - Deferred renderer on top of the backend
// =============================================================================
//
// Owns every GPU object of the application and drives one frame per
// `render()` call:
//
//   per light   shadow pass into that light's shadow-map layer
//   main pass   G-buffer -> lighting -> composite into the surface image
//
// A frame is first built as a list of DrawCommands (culling happens here)
// and then replayed into the slot's command buffer.
//
// Lifetimes:
//   startup     scene buffers + textures (one upload), shadow maps, light
//               ring, samplers, descriptor sets, shadow pass
//   per size    attachments, main render pass + framebuffers, pipelines
//   per frame   the slot's light block, written after its fence wait

use anyhow::{Context, Result};
use ash::vk;
use glam::{Mat4, Vec3};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use winit::window::Window;

use crate::backend::attachments::{ShadowMaps, TransientAttachments};
use crate::backend::descriptor::{DescriptorLayouts, DescriptorSets, Samplers};
use crate::backend::frame::{FrameOutcome, FramePipeline, VulkanFrameBackend};
use crate::backend::pipeline::{
    AspectPush, PipelineKind, PipelineLayouts, PipelineTarget, Pipelines, TransformPush,
};
use crate::backend::render_graph::{AttachmentKind, RenderGraph};
use crate::backend::resource::{
    create_image_view, GpuImage, HostBuffer, ImageSpec, ResourceDevice,
};
use crate::backend::shader::ShaderLibrary;
use crate::backend::transfer::{
    upload, SteadyState, TransferContext, TransferRecorder, Upload, UploadBatch,
};
use crate::backend::{DeviceContext, Swapchain};
use crate::config::Config;
use crate::cull::is_visible;
use crate::error::{RenderError, RenderResult};
use crate::lights::{LightBlock, LightRing, RotatingView, SpotLight};
use crate::platform::Clock;
use crate::scene::{checker_texture, DrawableObject, ModelData, Texture};

const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;
const CHECKER_MAGENTA: [u8; 4] = [0xFF, 0x00, 0xFF, 0xFF];
const CHECKER_BLACK: [u8; 4] = [0x00, 0x00, 0x00, 0xFF];

/// View-projection plus the view it was built from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewState {
    pub view_proj: Mat4,
    pub view: Mat4,
}

impl ViewState {
    pub fn of(view: &RotatingView, t: f32, aspect: f32) -> Self {
        Self {
            view_proj: view.view_projection(t, aspect),
            view: view.view(t),
        }
    }

    fn push(&self) -> TransformPush {
        TransformPush::new(self.view_proj, self.view)
    }
}

/// Everything a frame's command list depends on
pub struct FrameInputs<'a> {
    pub objects: &'a [DrawableObject],
    pub camera: ViewState,
    pub lights: &'a [ViewState],
    pub aspect: f32,
    /// Dynamic offset of this slot's light block
    pub light_offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DrawCommand {
    BeginShadowPass { light: usize },
    BeginMainPass,
    NextSubpass,
    EndPass,
    BindPipeline(PipelineKind),
    PushTransform(TransformPush),
    PushAspect(AspectPush),
    /// Vertex and index buffer of the model
    BindModel,
    /// Geometry set of the texture, or the default set
    BindMaterial(Option<u32>),
    BindLighting { light_offset: u32 },
    BindComposite,
    DrawIndexed { index_start: u32, index_count: u32 },
    /// One triangle covering the screen
    DrawFullscreen,
}

fn push_model_draws(
    commands: &mut Vec<DrawCommand>,
    objects: &[DrawableObject],
    view: &ViewState,
    textured: bool,
) {
    commands.push(DrawCommand::PushTransform(view.push()));
    commands.push(DrawCommand::BindModel);
    let mut bound = None;
    for object in objects {
        if !is_visible(&object.aabb, &view.view_proj) {
            continue;
        }
        if textured && bound != Some(object.texture) {
            commands.push(DrawCommand::BindMaterial(object.texture));
            bound = Some(object.texture);
        }
        commands.push(DrawCommand::DrawIndexed {
            index_start: object.index_start,
            index_count: object.index_count,
        });
    }
}

/// Culled command list of one frame
pub fn build_frame_commands(inputs: &FrameInputs) -> Vec<DrawCommand> {
    let mut commands = Vec::new();

    for (light, view) in inputs.lights.iter().enumerate() {
        commands.push(DrawCommand::BeginShadowPass { light });
        commands.push(DrawCommand::BindPipeline(PipelineKind::Shadow));
        push_model_draws(&mut commands, inputs.objects, view, false);
        commands.push(DrawCommand::EndPass);
    }

    let aspect = AspectPush {
        aspect: inputs.aspect,
    };
    commands.push(DrawCommand::BeginMainPass);
    commands.push(DrawCommand::BindPipeline(PipelineKind::Geometry));
    push_model_draws(&mut commands, inputs.objects, &inputs.camera, true);

    commands.push(DrawCommand::NextSubpass);
    commands.push(DrawCommand::BindPipeline(PipelineKind::Lighting));
    commands.push(DrawCommand::PushAspect(aspect));
    commands.push(DrawCommand::BindLighting {
        light_offset: inputs.light_offset,
    });
    commands.push(DrawCommand::DrawFullscreen);

    commands.push(DrawCommand::NextSubpass);
    commands.push(DrawCommand::BindPipeline(PipelineKind::Composite));
    commands.push(DrawCommand::PushAspect(aspect));
    commands.push(DrawCommand::BindComposite);
    commands.push(DrawCommand::DrawFullscreen);
    commands.push(DrawCommand::EndPass);

    commands
}

/// Model geometry and textures, uploaded in one transaction
pub struct SceneResources {
    batch: UploadBatch,
    pub objects: Vec<DrawableObject>,
    pub texture_count: u32,
}

impl SceneResources {
    const VERTEX_BUFFER: usize = 0;
    const INDEX_BUFFER: usize = 1;
    const DEFAULT_TEXTURE: usize = 2;
    const FIRST_TEXTURE: usize = 3;

    /// Magenta/black 4x4 texture for objects without one
    pub fn default_texture() -> Texture {
        checker_texture(4, 4, CHECKER_MAGENTA, CHECKER_BLACK)
    }

    /// Vertex buffer, index buffer, default texture, then the model textures
    pub fn uploads<'a>(model: &'a ModelData, default_texture: &'a Texture) -> Vec<Upload<'a>> {
        let texture_steady = SteadyState::image(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        );

        let mut uploads = vec![
            Upload::buffer(
                model.vertex_bytes(),
                vk::BufferUsageFlags::VERTEX_BUFFER,
                SteadyState::buffer(
                    vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
                    vk::PipelineStageFlags::VERTEX_INPUT,
                ),
            ),
            Upload::buffer(
                model.index_bytes(),
                vk::BufferUsageFlags::INDEX_BUFFER,
                SteadyState::buffer(
                    vk::AccessFlags::INDEX_READ,
                    vk::PipelineStageFlags::VERTEX_INPUT,
                ),
            ),
        ];

        let mut checker =
            ImageSpec::texture(default_texture.width, default_texture.height, TEXTURE_FORMAT);
        checker.mip_levels = 1;
        uploads.push(Upload::image(checker, Some(&default_texture.pixels), texture_steady));

        for texture in &model.textures {
            let spec = ImageSpec::texture(texture.width, texture.height, TEXTURE_FORMAT);
            uploads.push(Upload::image(spec, Some(&texture.pixels), texture_steady).with_mips());
        }
        uploads
    }

    pub fn upload<D, R>(device: &D, recorder: &mut R, model: &ModelData) -> RenderResult<Self>
    where
        D: ResourceDevice + ?Sized,
        R: TransferRecorder + ?Sized,
    {
        let default_texture = Self::default_texture();
        let batch = upload(device, recorder, &Self::uploads(model, &default_texture))?;
        log::info!(
            "Uploaded scene: {} objects, {} vertices, {} indices, {} textures",
            model.objects.len(),
            model.vertices.len(),
            model.indices.len(),
            model.textures.len()
        );
        Ok(Self {
            batch,
            objects: model.objects.clone(),
            texture_count: model.textures.len() as u32,
        })
    }

    pub fn vertex_buffer(&self) -> RenderResult<vk::Buffer> {
        Ok(self.batch.buffer(Self::VERTEX_BUFFER)?.handle)
    }

    pub fn index_buffer(&self) -> RenderResult<vk::Buffer> {
        Ok(self.batch.buffer(Self::INDEX_BUFFER)?.handle)
    }

    pub fn default_texture_image(&self) -> RenderResult<&GpuImage> {
        self.batch.image(Self::DEFAULT_TEXTURE)
    }

    pub fn texture_image(&self, index: u32) -> RenderResult<&GpuImage> {
        self.batch.image(Self::FIRST_TEXTURE + index as usize)
    }

    pub fn destroy<D: ResourceDevice + ?Sized>(self, device: &D) {
        self.batch.destroy(device);
    }
}

/// One light block per frame slot in a host-visible ring
pub struct LightUniforms {
    buffer: HostBuffer,
    ring: LightRing,
}

impl LightUniforms {
    pub fn new<D: ResourceDevice + ?Sized>(
        device: &D,
        slots: u32,
        min_uniform_alignment: u64,
    ) -> RenderResult<Self> {
        let ring = LightRing::new(slots, min_uniform_alignment);
        let buffer = HostBuffer::new(device, ring.size(), vk::BufferUsageFlags::UNIFORM_BUFFER)?;
        Ok(Self { buffer, ring })
    }

    pub fn offset(&self, slot: usize) -> u32 {
        self.ring.offset(slot as u32) as u32
    }

    /// Only called once the slot's previous frame has completed
    pub fn write<D: ResourceDevice + ?Sized>(
        &self,
        device: &D,
        slot: usize,
        block: &LightBlock,
    ) -> RenderResult<()> {
        self.buffer
            .write(device, self.ring.offset(slot as u32), block.as_bytes())
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    pub fn destroy<D: ResourceDevice + ?Sized>(self, device: &D) {
        self.buffer.destroy(device);
    }
}

/// Handles the recorded commands refer to
struct RecordTargets<'a> {
    device: &'a ash::Device,
    command_buffer: vk::CommandBuffer,
    main_pass: vk::RenderPass,
    main_framebuffer: vk::Framebuffer,
    main_extent: vk::Extent2D,
    main_clear: &'a [vk::ClearValue],
    shadow_pass: vk::RenderPass,
    shadow_framebuffers: &'a [vk::Framebuffer],
    shadow_extent: vk::Extent2D,
    shadow_clear: &'a [vk::ClearValue],
    pipelines: &'a Pipelines,
    layouts: &'a PipelineLayouts,
    sets: &'a DescriptorSets,
    vertex_buffer: vk::Buffer,
    index_buffer: vk::Buffer,
}

impl RecordTargets<'_> {
    fn begin_pass(
        &self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear: &[vk::ClearValue],
    ) {
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(clear);
        unsafe {
            self.device.cmd_begin_render_pass(
                self.command_buffer,
                &begin_info,
                vk::SubpassContents::INLINE,
            )
        };
    }

    fn bind_set(&self, kind: PipelineKind, set: vk::DescriptorSet, dynamic_offsets: &[u32]) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.layouts.get(kind),
                0,
                &[set],
                dynamic_offsets,
            )
        };
    }

    fn push<T: bytemuck::Pod>(&self, kind: PipelineKind, value: &T) {
        let range = kind.push_constant_range();
        unsafe {
            self.device.cmd_push_constants(
                self.command_buffer,
                self.layouts.get(kind),
                range.stage_flags,
                0,
                bytemuck::bytes_of(value),
            )
        };
    }

    fn record(&self, commands: &[DrawCommand]) -> RenderResult<()> {
        let device = self.device;
        let cb = self.command_buffer;
        let mut pipeline = PipelineKind::Geometry;

        for command in commands {
            match *command {
                DrawCommand::BeginShadowPass { light } => {
                    let framebuffer = *self.shadow_framebuffers.get(light).ok_or_else(|| {
                        let message = format!("no shadow framebuffer for light {light}");
                        RenderError::InvalidGraph(message)
                    })?;
                    self.begin_pass(
                        self.shadow_pass,
                        framebuffer,
                        self.shadow_extent,
                        self.shadow_clear,
                    );
                }
                DrawCommand::BeginMainPass => self.begin_pass(
                    self.main_pass,
                    self.main_framebuffer,
                    self.main_extent,
                    self.main_clear,
                ),
                DrawCommand::NextSubpass => unsafe {
                    device.cmd_next_subpass(cb, vk::SubpassContents::INLINE)
                },
                DrawCommand::EndPass => unsafe { device.cmd_end_render_pass(cb) },
                DrawCommand::BindPipeline(kind) => {
                    pipeline = kind;
                    unsafe {
                        device.cmd_bind_pipeline(
                            cb,
                            vk::PipelineBindPoint::GRAPHICS,
                            self.pipelines.get(kind),
                        )
                    };
                }
                DrawCommand::PushTransform(push) => self.push(pipeline, &push),
                DrawCommand::PushAspect(push) => self.push(pipeline, &push),
                DrawCommand::BindModel => unsafe {
                    device.cmd_bind_vertex_buffers(cb, 0, &[self.vertex_buffer], &[0]);
                    device.cmd_bind_index_buffer(cb, self.index_buffer, 0, vk::IndexType::UINT32);
                },
                DrawCommand::BindMaterial(texture) => {
                    self.bind_set(pipeline, self.sets.for_texture(texture), &[])
                }
                DrawCommand::BindLighting { light_offset } => {
                    self.bind_set(pipeline, self.sets.lighting, &[light_offset])
                }
                DrawCommand::BindComposite => self.bind_set(pipeline, self.sets.composite, &[]),
                DrawCommand::DrawIndexed {
                    index_start,
                    index_count,
                } => unsafe { device.cmd_draw_indexed(cb, index_count, 1, index_start, 0, 0) },
                DrawCommand::DrawFullscreen => unsafe { device.cmd_draw(cb, 3, 1, 0, 0) },
            }
        }
        Ok(())
    }
}

/// Objects tied to the surface size; rebuilt on resize
struct SizeDependent {
    attachments: Option<TransientAttachments>,
    graph: RenderGraph,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    pipelines: Option<Pipelines>,
}

impl SizeDependent {
    /// Attachments -> render graph + framebuffers -> pipelines
    fn new(
        ctx: &DeviceContext,
        transfer: &mut TransferContext,
        swapchain: &Swapchain,
        shaders: &ShaderLibrary,
        layouts: &PipelineLayouts,
        shadow: &PipelineTarget,
    ) -> RenderResult<Self> {
        let device = &ctx.device;
        let mut size = Self {
            attachments: None,
            graph: RenderGraph::deferred(swapchain.format)?,
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::with_capacity(swapchain.image_views.len()),
            pipelines: None,
        };

        let built = (|| -> RenderResult<()> {
            let attachments = size
                .attachments
                .insert(TransientAttachments::new(ctx, device, transfer, swapchain.extent)?);
            size.render_pass = size.graph.create_render_pass(device)?;

            for &surface_view in &swapchain.image_views {
                let framebuffer = size.graph.create_framebuffer(
                    device,
                    size.render_pass,
                    swapchain.extent,
                    |kind| match kind {
                        AttachmentKind::Surface => Some(surface_view),
                        other => attachments.view(other),
                    },
                )?;
                size.framebuffers.push(framebuffer);
            }

            let main = PipelineTarget {
                graph: &size.graph,
                render_pass: size.render_pass,
                extent: swapchain.extent,
            };
            size.pipelines = Some(Pipelines::new(device, layouts, shaders, &main, shadow)?);
            Ok(())
        })();

        match built {
            Ok(()) => Ok(size),
            Err(e) => {
                size.destroy(ctx);
                Err(e)
            }
        }
    }

    fn attachment_view(&self, kind: AttachmentKind) -> Option<vk::ImageView> {
        self.attachments.as_ref().and_then(|a| a.view(kind))
    }

    fn destroy(&mut self, ctx: &DeviceContext) {
        let device = &ctx.device;
        if let Some(pipelines) = self.pipelines.take() {
            pipelines.destroy(device);
        }
        unsafe {
            for framebuffer in self.framebuffers.drain(..) {
                device.destroy_framebuffer(framebuffer, None);
            }
            if self.render_pass != vk::RenderPass::null() {
                device.destroy_render_pass(self.render_pass, None);
                self.render_pass = vk::RenderPass::null();
            }
        }
        if let Some(attachments) = self.attachments.take() {
            attachments.destroy(ctx, device);
        }
    }
}

/// Image views of the scene textures
struct TextureViews {
    default_view: vk::ImageView,
    views: Vec<vk::ImageView>,
}

impl TextureViews {
    fn new(device: &ash::Device, scene: &SceneResources) -> RenderResult<Self> {
        let mut views = Self {
            default_view: vk::ImageView::null(),
            views: Vec::with_capacity(scene.texture_count as usize),
        };
        let created = (|| -> RenderResult<()> {
            views.default_view = create_image_view(
                device,
                scene.default_texture_image()?,
                vk::ImageViewType::TYPE_2D,
                0,
                1,
            )?;
            for index in 0..scene.texture_count {
                let image = scene.texture_image(index)?;
                views
                    .views
                    .push(create_image_view(device, image, vk::ImageViewType::TYPE_2D, 0, 1)?);
            }
            Ok(())
        })();
        match created {
            Ok(()) => Ok(views),
            Err(e) => {
                views.destroy(device);
                Err(e)
            }
        }
    }

    fn destroy(&self, device: &ash::Device) {
        unsafe {
            if self.default_view != vk::ImageView::null() {
                device.destroy_image_view(self.default_view, None);
            }
            for view in &self.views {
                device.destroy_image_view(*view, None);
            }
        }
    }
}

pub struct DeferredRenderer {
    ctx: Arc<DeviceContext>,
    swapchain: Swapchain,
    present_mode: vk::PresentModeKHR,
    transfer: TransferContext,
    frames: FramePipeline,
    shaders: ShaderLibrary,
    samplers: Samplers,
    descriptor_layouts: DescriptorLayouts,
    pipeline_layouts: PipelineLayouts,
    sets: DescriptorSets,
    scene: Option<SceneResources>,
    texture_views: TextureViews,
    shadow_maps: Option<ShadowMaps>,
    shadow_graph: RenderGraph,
    shadow_pass: vk::RenderPass,
    shadow_framebuffers: Vec<vk::Framebuffer>,
    light_uniforms: Option<LightUniforms>,
    size: Option<SizeDependent>,

    camera: RotatingView,
    camera_position: Vec3,
    lights: Vec<SpotLight>,
    clock: Clock,
    fence_timeout_ns: u64,
    needs_rebuild: bool,
}

impl DeferredRenderer {
    pub fn new(window: &Window, config: &Config, model: &ModelData) -> Result<Self> {
        let display = window
            .display_handle()
            .context("Window has no display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Window has no window handle")?
            .as_raw();

        // Validation only in debug builds
        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let ctx = DeviceContext::new(
            &config.window.title,
            enable_validation,
            display,
            window_handle,
        )?;

        let size = window.inner_size();
        let present_mode = config.get_present_mode();
        let swapchain = Swapchain::new(ctx.clone(), size.width, size.height, present_mode, None)?;

        let mut transfer = TransferContext::new(&ctx)?;
        let frames = FramePipeline::new(&ctx, config.graphics.frames_in_flight as usize)?;
        let shaders = ShaderLibrary::load(&ctx.device, &config.scene.shader_dir)?;

        let scene = SceneResources::upload(ctx.as_ref(), &mut transfer, model)
            .context("Failed to upload the scene")?;
        let texture_views = TextureViews::new(&ctx.device, &scene)?;

        let lights = config.lights.spot.clone();
        let shadow_maps = ShadowMaps::new(
            ctx.as_ref(),
            &ctx.device,
            &mut transfer,
            config.graphics.shadow_map_size,
            lights.len() as u32,
        )?;
        let light_uniforms = LightUniforms::new(
            ctx.as_ref(),
            frames.slot_count() as u32,
            ctx.limits().min_uniform_buffer_offset_alignment,
        )?;

        let samplers = Samplers::new(&ctx.device, ctx.limits())?;
        let descriptor_layouts = DescriptorLayouts::new(&ctx.device, samplers.shadow)?;
        let pipeline_layouts = PipelineLayouts::new(&ctx.device, &descriptor_layouts)?;

        let sets = DescriptorSets::allocate(&ctx.device, &descriptor_layouts, scene.texture_count)?;
        sets.write_textures(
            &ctx.device,
            &samplers,
            texture_views.default_view,
            &texture_views.views,
        );
        sets.write_lighting_resources(
            &ctx.device,
            shadow_maps.array_view,
            light_uniforms.buffer(),
            LightBlock::SIZE,
        );

        let shadow_graph = RenderGraph::shadow()?;
        let shadow_pass = shadow_graph.create_render_pass(&ctx.device)?;
        let shadow_framebuffers = shadow_maps
            .layer_views
            .iter()
            .map(|&view| {
                let extent = shadow_maps.extent();
                shadow_graph.create_framebuffer(&ctx.device, shadow_pass, extent, |_| Some(view))
            })
            .collect::<RenderResult<Vec<_>>>()?;

        let mut renderer = Self {
            ctx,
            swapchain,
            present_mode,
            transfer,
            frames,
            shaders,
            samplers,
            descriptor_layouts,
            pipeline_layouts,
            sets,
            scene: Some(scene),
            texture_views,
            shadow_maps: Some(shadow_maps),
            shadow_graph,
            shadow_pass,
            shadow_framebuffers,
            light_uniforms: Some(light_uniforms),
            size: None,
            camera: config.camera,
            camera_position: Vec3::from(config.scene.camera_position),
            lights,
            clock: Clock::new(),
            fence_timeout_ns: config.fence_timeout_ns(),
            needs_rebuild: false,
        };
        renderer.build_size_dependent()?;

        log::info!(
            "Deferred renderer ready: {} frames in flight, {} lights",
            renderer.frames.slot_count(),
            renderer.lights.len()
        );
        Ok(renderer)
    }

    fn shadow_extent(&self) -> vk::Extent2D {
        self.shadow_maps
            .as_ref()
            .map_or(vk::Extent2D::default(), ShadowMaps::extent)
    }

    fn build_size_dependent(&mut self) -> RenderResult<()> {
        let shadow = PipelineTarget {
            graph: &self.shadow_graph,
            render_pass: self.shadow_pass,
            extent: self.shadow_extent(),
        };
        let size = SizeDependent::new(
            &self.ctx,
            &mut self.transfer,
            &self.swapchain,
            &self.shaders,
            &self.pipeline_layouts,
            &shadow,
        )?;
        self.sets
            .write_input_attachments(&self.ctx.device, |kind| size.attachment_view(kind))?;
        self.size = Some(size);
        Ok(())
    }

    /// Ask for a swapchain rebuild before the next frame
    pub fn request_rebuild(&mut self) {
        self.needs_rebuild = true;
    }

    /// Stop-the-world rebuild of everything tied to the surface size
    pub fn rebuild(&mut self, width: u32, height: u32) -> RenderResult<()> {
        if width == 0 || height == 0 {
            // Minimised: keep the old swapchain until there is something to draw to
            self.needs_rebuild = true;
            return Ok(());
        }
        log::info!("Rebuilding swapchain for {}x{}", width, height);

        self.ctx.wait_idle()?;
        if let Some(mut size) = self.size.take() {
            size.destroy(&self.ctx);
        }

        let swapchain = Swapchain::new(
            self.ctx.clone(),
            width,
            height,
            self.present_mode,
            Some(&self.swapchain),
        )?;
        self.swapchain = swapchain;

        self.build_size_dependent()?;
        self.needs_rebuild = false;
        Ok(())
    }

    /// Draw one frame; `window_size` is used if the surface must be rebuilt first
    pub fn render(&mut self, window_size: (u32, u32)) -> RenderResult<()> {
        if self.needs_rebuild {
            self.rebuild(window_size.0, window_size.1)?;
            if self.needs_rebuild {
                return Ok(());
            }
        }

        let t = self.clock.seconds() as f32;
        let aspect = self.swapchain.aspect_ratio();
        let camera = ViewState::of(&self.camera, t, aspect);
        let light_views: Vec<ViewState> = self
            .lights
            .iter()
            .map(|light| ViewState {
                view_proj: light.shadow_view_projection(t),
                view: light.shadow_view_matrix(t),
            })
            .collect();
        let light_block = LightBlock::new(self.camera_position, &self.lights, t);

        let size = self
            .size
            .as_ref()
            .ok_or_else(|| RenderError::Capability("no surface resources".to_string()))?;
        let scene = self
            .scene
            .as_ref()
            .ok_or_else(|| RenderError::Capability("no scene".to_string()))?;
        let light_uniforms = self
            .light_uniforms
            .as_ref()
            .ok_or_else(|| RenderError::Capability("no light buffer".to_string()))?;
        let pipelines = size
            .pipelines
            .as_ref()
            .ok_or_else(|| RenderError::Capability("no pipelines".to_string()))?;
        let vertex_buffer = scene.vertex_buffer()?;
        let index_buffer = scene.index_buffer()?;
        let main_clear = size.graph.clear_values();
        let shadow_clear = self.shadow_graph.clear_values();
        let shadow_extent = self.shadow_extent();

        let ctx = self.ctx.as_ref();
        let device = &ctx.device;
        let sets = &self.sets;
        let layouts = &self.pipeline_layouts;
        let shadow_pass = self.shadow_pass;
        let shadow_framebuffers = &self.shadow_framebuffers;

        let mut backend = VulkanFrameBackend::new(ctx, &self.swapchain, self.fence_timeout_ns);
        let outcome = self.frames.render_frame(&mut backend, |frame| {
            light_uniforms.write(ctx, frame.slot_index, &light_block)?;

            let main_framebuffer = *size
                .framebuffers
                .get(frame.image_index as usize)
                .ok_or_else(|| {
                    let message = format!("no framebuffer for image {}", frame.image_index);
                    RenderError::InvalidGraph(message)
                })?;
            let commands = build_frame_commands(&FrameInputs {
                objects: &scene.objects,
                camera,
                lights: &light_views,
                aspect,
                light_offset: light_uniforms.offset(frame.slot_index),
            });

            RecordTargets {
                device,
                command_buffer: frame.command_buffer,
                main_pass: size.render_pass,
                main_framebuffer,
                main_extent: self.swapchain.extent,
                main_clear: &main_clear,
                shadow_pass,
                shadow_framebuffers,
                shadow_extent,
                shadow_clear: &shadow_clear,
                pipelines,
                layouts,
                sets,
                vertex_buffer,
                index_buffer,
            }
            .record(&commands)
        })?;

        if outcome.needs_rebuild() {
            if outcome == FrameOutcome::OutOfDate {
                log::debug!("Surface out of date, rebuilding");
            }
            self.needs_rebuild = true;
        }
        Ok(())
    }
}

impl Drop for DeferredRenderer {
    fn drop(&mut self) {
        log::info!("Destroying renderer...");
        let ctx = self.ctx.clone();
        let device = &ctx.device;
        if let Err(e) = ctx.wait_idle() {
            log::error!("Device did not go idle before teardown: {}", e);
        }

        if let Some(mut size) = self.size.take() {
            size.destroy(&ctx);
        }
        self.frames.destroy(device);
        unsafe {
            for framebuffer in self.shadow_framebuffers.drain(..) {
                device.destroy_framebuffer(framebuffer, None);
            }
            device.destroy_render_pass(self.shadow_pass, None);
        }
        self.pipeline_layouts.destroy(device);
        self.sets.destroy(device);
        self.descriptor_layouts.destroy(device);
        self.samplers.destroy(device);
        self.texture_views.destroy(device);
        if let Some(scene) = self.scene.take() {
            scene.destroy(ctx.as_ref());
        }
        if let Some(shadow_maps) = self.shadow_maps.take() {
            shadow_maps.destroy(ctx.as_ref(), device);
        }
        if let Some(light_uniforms) = self.light_uniforms.take() {
            light_uniforms.destroy(ctx.as_ref());
        }
        self.shaders.destroy(device);
        self.transfer.destroy();
    }
}
