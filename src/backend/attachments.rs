// Render targets - size-dependent attachments and the shadow-map array
//
// The five transient attachments of the main pass are created together in
// one upload transaction without data: the transaction only moves them
// from UNDEFINED into the layout the render pass expects them in. They are
// recreated whenever the surface size changes.
//
// The shadow-map array has one layer per light and lives as long as the
// renderer. Each layer gets its own view to render into; the lighting pass
// samples all of them through one array view.

use ash::vk;

use super::render_graph::AttachmentKind;
use super::resource::{create_image_view, GpuImage, ImageSpec, ResourceDevice};
use super::transfer::{upload, SteadyState, TransferRecorder, Upload, UploadBatch};
use crate::error::RenderResult;

/// Layout, access and stage an attachment is handed to the render pass in
pub fn attachment_steady_state(kind: AttachmentKind) -> SteadyState {
    match kind {
        AttachmentKind::Depth => SteadyState::image(
            kind.resting_layout(),
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        ),
        AttachmentKind::ShadowDepth => SteadyState::image(
            kind.resting_layout(),
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        _ => SteadyState::image(
            kind.resting_layout(),
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
    }
}

pub fn attachment_spec(kind: AttachmentKind, extent: vk::Extent2D) -> ImageSpec {
    ImageSpec::attachment(
        extent.width,
        extent.height,
        kind.format(vk::Format::UNDEFINED),
        kind.usage(),
        kind.aspect(),
    )
}

/// Uploads creating every transient attachment, in `AttachmentKind::TRANSIENT` order
pub fn transient_uploads(extent: vk::Extent2D) -> Vec<Upload<'static>> {
    AttachmentKind::TRANSIENT
        .iter()
        .map(|&kind| {
            Upload::image(attachment_spec(kind, extent), None, attachment_steady_state(kind))
        })
        .collect()
}

pub fn shadow_upload(size: u32, layers: u32) -> Upload<'static> {
    let kind = AttachmentKind::ShadowDepth;
    let spec = attachment_spec(
        kind,
        vk::Extent2D {
            width: size,
            height: size,
        },
    )
    .with_layers(layers.max(1));
    Upload::image(spec, None, attachment_steady_state(kind))
}

/// G-buffer, lit colour and depth for one surface size
pub struct TransientAttachments {
    batch: UploadBatch,
    views: Vec<(AttachmentKind, vk::ImageView)>,
    pub extent: vk::Extent2D,
}

impl TransientAttachments {
    pub fn new<D, R>(
        device: &D,
        raw: &ash::Device,
        recorder: &mut R,
        extent: vk::Extent2D,
    ) -> RenderResult<Self>
    where
        D: ResourceDevice + ?Sized,
        R: TransferRecorder + ?Sized,
    {
        let batch = upload(device, recorder, &transient_uploads(extent))?;
        let mut attachments = Self {
            batch,
            views: Vec::with_capacity(AttachmentKind::TRANSIENT.len()),
            extent,
        };

        for (index, kind) in AttachmentKind::TRANSIENT.iter().enumerate() {
            let view = attachments.batch.image(index).and_then(|image| {
                create_image_view(raw, image, vk::ImageViewType::TYPE_2D, 0, 1)
            });
            match view {
                Ok(view) => attachments.views.push((*kind, view)),
                Err(e) => {
                    attachments.destroy(device, raw);
                    return Err(e);
                }
            }
        }

        log::debug!(
            "Created {} attachments at {}x{}",
            attachments.views.len(),
            extent.width,
            extent.height
        );
        Ok(attachments)
    }

    pub fn view(&self, kind: AttachmentKind) -> Option<vk::ImageView> {
        self.views
            .iter()
            .find(|(candidate, _)| *candidate == kind)
            .map(|(_, view)| *view)
    }

    pub fn destroy<D: ResourceDevice + ?Sized>(self, device: &D, raw: &ash::Device) {
        for (_, view) in &self.views {
            unsafe { raw.destroy_image_view(*view, None) };
        }
        self.batch.destroy(device);
    }
}

/// Depth array with one layer per light
pub struct ShadowMaps {
    batch: UploadBatch,
    /// Render target of light `i`
    pub layer_views: Vec<vk::ImageView>,
    /// Sampled by the lighting pass
    pub array_view: vk::ImageView,
    pub size: u32,
}

impl ShadowMaps {
    pub fn new<D, R>(
        device: &D,
        raw: &ash::Device,
        recorder: &mut R,
        size: u32,
        layers: u32,
    ) -> RenderResult<Self>
    where
        D: ResourceDevice + ?Sized,
        R: TransferRecorder + ?Sized,
    {
        let batch = upload(device, recorder, &[shadow_upload(size, layers)])?;
        let mut maps = Self {
            batch,
            layer_views: Vec::new(),
            array_view: vk::ImageView::null(),
            size,
        };

        if let Err(e) = maps.create_views(raw) {
            maps.destroy(device, raw);
            return Err(e);
        }
        log::info!("Created {}x{} shadow maps for {} lights", size, size, maps.layer_views.len());
        Ok(maps)
    }

    fn create_views(&mut self, raw: &ash::Device) -> RenderResult<()> {
        let image: GpuImage = *self.batch.image(0)?;
        for layer in 0..image.spec.array_layers {
            self.layer_views
                .push(create_image_view(raw, &image, vk::ImageViewType::TYPE_2D, layer, 1)?);
        }
        self.array_view = create_image_view(
            raw,
            &image,
            vk::ImageViewType::TYPE_2D_ARRAY,
            0,
            image.spec.array_layers,
        )?;
        Ok(())
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.size,
            height: self.size,
        }
    }

    pub fn destroy<D: ResourceDevice + ?Sized>(self, device: &D, raw: &ash::Device) {
        unsafe {
            for view in &self.layer_views {
                raw.destroy_image_view(*view, None);
            }
            if self.array_view != vk::ImageView::null() {
                raw.destroy_image_view(self.array_view, None);
            }
        }
        self.batch.destroy(device);
    }
}
