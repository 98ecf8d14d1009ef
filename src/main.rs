// Demo host application
//
// Owns the window and event loop, forwards resize notifications into the
// renderer, and drives the frame loop with one spinning cube item.

use anyhow::{Context, Result};
use glam::{Mat4, Vec3};
use kiln::{Config, RenderItemDesc, RenderItemKey, Renderer, Vertex};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

fn main() -> Result<()> {
    let config = Config::load();

    init_logging();
    log::info!("Starting kiln demo");
    log::info!("Window: {}x{}", config.window.width, config.window.height);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();
}

// A unit cube with per-corner colors
const CUBE_VERTICES: [Vertex; 8] = [
    Vertex { position: [-0.5, -0.5, -0.5], color: [1.0, 0.2, 0.2], uv: [0.0, 0.0] },
    Vertex { position: [0.5, -0.5, -0.5], color: [0.2, 1.0, 0.2], uv: [1.0, 0.0] },
    Vertex { position: [0.5, 0.5, -0.5], color: [0.2, 0.2, 1.0], uv: [1.0, 1.0] },
    Vertex { position: [-0.5, 0.5, -0.5], color: [1.0, 1.0, 0.2], uv: [0.0, 1.0] },
    Vertex { position: [-0.5, -0.5, 0.5], color: [1.0, 0.2, 1.0], uv: [1.0, 0.0] },
    Vertex { position: [0.5, -0.5, 0.5], color: [0.2, 1.0, 1.0], uv: [0.0, 0.0] },
    Vertex { position: [0.5, 0.5, 0.5], color: [1.0, 1.0, 1.0], uv: [0.0, 1.0] },
    Vertex { position: [-0.5, 0.5, 0.5], color: [0.2, 0.2, 0.2], uv: [1.0, 1.0] },
];

#[rustfmt::skip]
const CUBE_INDICES: [u32; 36] = [
    0, 2, 1, 0, 3, 2, // back
    4, 5, 6, 4, 6, 7, // front
    0, 1, 5, 0, 5, 4, // bottom
    3, 7, 6, 3, 6, 2, // top
    0, 4, 7, 0, 7, 3, // left
    1, 2, 6, 1, 6, 5, // right
];

struct App {
    config: Config,
    window: Option<Arc<Window>>,
    renderer: Option<Renderer>,
    cube: Option<RenderItemKey>,

    start: Instant,
    frame_count: u32,
    last_fps_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            config,
            window: None,
            renderer: None,
            cube: None,
            start: now,
            frame_count: 0,
            last_fps_update: now,
        }
    }

    fn init_renderer(&mut self, window: &Arc<Window>) -> Result<()> {
        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        let mut renderer = Renderer::new(self.config.clone(), display_handle, window_handle)?;

        let cube = renderer.create_render_item(&RenderItemDesc {
            vertices: bytemuck::cast_slice(&CUBE_VERTICES),
            indices: bytemuck::cast_slice(&CUBE_INDICES),
            texture: None,
        })?;

        self.cube = Some(cube);
        self.renderer = Some(renderer);
        Ok(())
    }

    fn render_frame(&mut self) -> Result<()> {
        let (Some(renderer), Some(window)) = (self.renderer.as_mut(), self.window.as_ref()) else {
            return Ok(());
        };

        // Spin the cube
        let t = self.start.elapsed().as_secs_f32();
        if let Some(cube) = self.cube {
            let spin = Mat4::from_rotation_y(t) * Mat4::from_rotation_x(t * 0.6);
            renderer.set_transform(cube, spin)?;
        }

        if !renderer.begin_frame()? {
            // Minimized or mid-recreate; try again next frame
            return Ok(());
        }

        let size = window.inner_size();
        let aspect = size.width.max(1) as f32 / size.height.max(1) as f32;
        let view = Mat4::look_at_rh(Vec3::new(0.0, 1.2, 3.0), Vec3::ZERO, Vec3::Y);
        let mut proj = Mat4::perspective_rh(60f32.to_radians(), aspect, 0.1, 100.0);
        // Vulkan clip space is y-down
        proj.y_axis.y *= -1.0;

        renderer.end_frame(proj * view)?;
        self.update_fps();
        Ok(())
    }

    fn update_fps(&mut self) {
        self.frame_count += 1;

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(ref window) = self.window {
                window.set_title(&format!("{} - {:.0} FPS", self.config.window.title, fps));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

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
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.render_frame() {
                    log::error!("Render error: {:?}", e);
                    event_loop.exit();
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(KeyCode::Escape) = event.physical_key {
                        log::info!("ESC pressed, exiting...");
                        event_loop.exit();
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
