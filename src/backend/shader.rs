// Shader module loading
//
// Vulkan uses SPIR-V bytecode for shaders. build.rs compiles the GLSL
// sources next to themselves (shaders/<name>.spv); the modules are loaded
// once at startup and kept alive so pipelines can be rebuilt on resize.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

use crate::platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderId {
    ShadowVert,
    GBufferVert,
    GBufferFrag,
    FullscreenVert,
    LightingFrag,
    CompositeFrag,
}

impl ShaderId {
    pub const ALL: [ShaderId; 6] = [
        ShaderId::ShadowVert,
        ShaderId::GBufferVert,
        ShaderId::GBufferFrag,
        ShaderId::FullscreenVert,
        ShaderId::LightingFrag,
        ShaderId::CompositeFrag,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Self::ShadowVert => "shadow.vert.spv",
            Self::GBufferVert => "gbuffer.vert.spv",
            Self::GBufferFrag => "gbuffer.frag.spv",
            Self::FullscreenVert => "fullscreen.vert.spv",
            Self::LightingFrag => "lighting.frag.spv",
            Self::CompositeFrag => "composite.frag.spv",
        }
    }

    pub fn stage(self) -> vk::ShaderStageFlags {
        match self {
            Self::ShadowVert | Self::GBufferVert | Self::FullscreenVert => {
                vk::ShaderStageFlags::VERTEX
            }
            Self::GBufferFrag | Self::LightingFrag | Self::CompositeFrag => {
                vk::ShaderStageFlags::FRAGMENT
            }
        }
    }
}

/// Create a shader module from SPIR-V bytes
pub fn create_shader_module(device: &ash::Device, code: &[u8]) -> Result<vk::ShaderModule> {
    // read_spv checks the magic and copies into properly aligned words
    let words = ash::util::read_spv(&mut Cursor::new(code)).context("Invalid SPIR-V")?;
    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    unsafe {
        device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

/// Every module the renderer's pipelines use
pub struct ShaderLibrary {
    modules: Vec<(ShaderId, vk::ShaderModule)>,
}

impl ShaderLibrary {
    pub fn load(device: &ash::Device, dir: &Path) -> Result<Self> {
        let mut library = Self {
            modules: Vec::with_capacity(ShaderId::ALL.len()),
        };
        for id in ShaderId::ALL {
            let path = dir.join(id.file_name());
            let module = platform::load_file(&path)
                .and_then(|code| create_shader_module(device, &code))
                .with_context(|| format!("Loading shader {}", path.display()));
            match module {
                Ok(module) => library.modules.push((id, module)),
                Err(e) => {
                    library.destroy(device);
                    return Err(e);
                }
            }
        }
        log::info!("Loaded {} shader modules from {}", library.modules.len(), dir.display());
        Ok(library)
    }

    pub fn module(&self, id: ShaderId) -> vk::ShaderModule {
        self.modules
            .iter()
            .find(|(candidate, _)| *candidate == id)
            .map_or(vk::ShaderModule::null(), |(_, module)| *module)
    }

    pub fn destroy(&self, device: &ash::Device) {
        for (_, module) in &self.modules {
            unsafe { device.destroy_shader_module(*module, None) };
        }
    }
}
