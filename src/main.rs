// =============================================================================
// DEFERRED VULKAN RENDERER
// =============================================================================
//
// A deferred renderer with spot-light shadows, built directly on ash.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (winit event loop, config, FPS title)                      │
// │    └── DeferredRenderer                                         │
// │          ├── FramePipeline (N slots: fence, semaphores, cmd)    │
// │          ├── Upload transactions (suballocated memory)          │
// │          └── Render graph: shadow pass + 3-subpass main pass    │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for the slot's fence (its previous frame is done)
// 2. Acquire a swapchain image
// 3. Write the slot's light block, record shadow + main passes
// 4. Submit, signalling the slot's fence
// 5. Present
//
// =============================================================================

mod backend;
mod config;
mod cull;
mod error;
mod lights;
mod platform;
mod renderer;
mod scene;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use config::Config;
use error::RenderError;
use renderer::DeferredRenderer;
use scene::ModelData;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting deferred renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!(
        "Present mode: {}, {} frames in flight",
        config.graphics.present_mode,
        config.graphics.frames_in_flight
    );

    let model = match &config.scene.model {
        Some(path) => ModelData::load(path)
            .with_context(|| format!("Failed to load model {}", path.display()))?,
        None => {
            log::info!("No model configured, drawing the procedural scene");
            ModelData::procedural()
        }
    };

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config, model);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging, optionally into the configured log file
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();

    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Deferred Renderer Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}

/// How the event loop answers a failed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameErrorAction {
    /// Rebuild the swapchain on the next redraw
    Rebuild,
    Exit,
}

impl FrameErrorAction {
    fn for_error(error: &RenderError) -> Self {
        if error.is_transient() {
            Self::Rebuild
        } else {
            Self::Exit
        }
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Window plus the renderer drawing into it.
///
/// The renderer is dropped before the window: its surface refers to it.
pub struct App {
    config: Config,
    /// Handed to the renderer once the window exists
    model: Option<ModelData>,

    renderer: Option<DeferredRenderer>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,
    is_minimized: bool,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    pub fn new(config: Config, model: ModelData) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            model: Some(model),
            renderer: None,
            window: None,
            is_fullscreen,
            is_minimized: false,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init_renderer(&mut self, window: &Window) -> Result<()> {
        let model = self.model.take().context("Renderer already initialized")?;
        let renderer = DeferredRenderer::new(window, &self.config, &model)?;
        self.renderer = Some(renderer);
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Draw one frame. Returns whether anything was submitted.
    fn render_frame(&mut self, event_loop: &ActiveEventLoop) -> bool {
        if self.is_minimized {
            return false;
        }
        let (Some(window), Some(renderer)) = (self.window.as_ref(), self.renderer.as_mut()) else {
            return false;
        };

        let size = window.inner_size();
        let error = match renderer.render((size.width, size.height)) {
            Ok(()) => return true,
            Err(e) => e,
        };
        match FrameErrorAction::for_error(&error) {
            FrameErrorAction::Rebuild => renderer.request_rebuild(),
            // A failed rebuild lands here as well
            FrameErrorAction::Exit => {
                if error.is_device_loss() {
                    log::error!("GPU device lost: {}", error);
                } else {
                    log::error!("Fatal render error: {}", error);
                }
                event_loop.exit();
            }
        }
        false
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;
            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            if let Some(renderer) = self.renderer.as_mut() {
                renderer.request_rebuild();
            }
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    pub fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));
        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_renderer(&window) {
            log::error!("Failed to initialize renderer: {:?}", e);
            event_loop.exit();
            return;
        }
        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.is_minimized = size.width == 0 || size.height == 0;
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.request_rebuild();
                }
            }

            WindowEvent::RedrawRequested => {
                if self.render_frame(event_loop) {
                    self.update_fps();
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        // Renderer teardown waits for the device to go idle
        self.renderer = None;
        log::info!("Cleanup complete");
    }
}
