//! DotMatrix Cam - Main Entry Point
//!
//! Turns a live camera feed into a dot-matrix rendering, augmented by a
//! depth or person-segmentation signal, with on-demand PNG capture.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dotmatrix_cam::config::AppConfig;
use dotmatrix_cam::App;
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowAttributes, WindowId};

const WINDOW_TITLE: &str = "DotMatrix Cam";
const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;
const TARGET_FPS: u32 = 60;

/// Application state machine
enum AppState {
    /// Initial state before the window is created
    Uninitialized,
    /// Window and graphics context are ready
    Running { window: Arc<Window>, app: App },
}

/// Main application handler implementing winit's ApplicationHandler trait
struct DotMatrixApp {
    state: AppState,
    config: AppConfig,
    next_redraw_at: Instant,
}

impl DotMatrixApp {
    fn new(config: AppConfig) -> Self {
        Self {
            state: AppState::Uninitialized,
            config,
            next_redraw_at: Instant::now(),
        }
    }
}

impl ApplicationHandler for DotMatrixApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        match &mut self.state {
            AppState::Uninitialized => {
                log::info!("Creating window...");

                let window_attributes = WindowAttributes::default()
                    .with_title(WINDOW_TITLE)
                    .with_inner_size(LogicalSize::new(DEFAULT_WIDTH, DEFAULT_HEIGHT));

                let window = Arc::new(
                    event_loop
                        .create_window(window_attributes)
                        .expect("Failed to create window"),
                );

                log::info!("Initializing renderer...");
                let mut app = pollster::block_on(App::new(window.clone(), self.config.clone()));
                app.resume();

                log::info!("DotMatrix Cam ready");
                log::info!("Keys: arrows = density/dot size, -/= = distortion, 1-6 = colors, S = capture");

                self.state = AppState::Running { window, app };
            }
            // Coming back from a host suspend: restart the depth engine.
            AppState::Running { app, .. } => app.resume(),
        }
    }

    fn suspended(&mut self, _event_loop: &ActiveEventLoop) {
        if let AppState::Running { app, .. } = &mut self.state {
            app.pause();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let AppState::Running { app, .. } = &mut self.state {
            app.release();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        let AppState::Running { window, app } = &mut self.state else {
            return;
        };

        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, exiting...");
                event_loop.exit();
            }

            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(key_code),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => match key_code {
                KeyCode::Escape => {
                    log::info!("Escape pressed, exiting...");
                    event_loop.exit();
                }
                KeyCode::F11 => {
                    if window.fullscreen().is_some() {
                        window.set_fullscreen(None);
                    } else {
                        window.set_fullscreen(Some(winit::window::Fullscreen::Borderless(None)));
                    }
                }
                KeyCode::ArrowUp => app.adjust_density(5.0),
                KeyCode::ArrowDown => app.adjust_density(-5.0),
                KeyCode::ArrowRight => app.adjust_dot_size(0.1),
                KeyCode::ArrowLeft => app.adjust_dot_size(-0.1),
                KeyCode::Equal => app.adjust_distortion(0.05),
                KeyCode::Minus => app.adjust_distortion(-0.05),
                KeyCode::Digit1 => app.select_theme(0),
                KeyCode::Digit2 => app.select_theme(1),
                KeyCode::Digit3 => app.select_theme(2),
                KeyCode::Digit4 => app.select_theme(3),
                KeyCode::Digit5 => app.select_theme(4),
                KeyCode::Digit6 => app.select_theme(5),
                KeyCode::KeyS | KeyCode::Space => app.capture_photo(),
                _ => {}
            },

            WindowEvent::Resized(physical_size) => {
                app.resize(physical_size);
            }

            WindowEvent::RedrawRequested => match app.update_and_render() {
                Ok(_) => {}
                Err(wgpu::SurfaceError::Lost) => {
                    log::warn!("Surface lost, reconfiguring...");
                    app.resize(app.size());
                }
                Err(wgpu::SurfaceError::OutOfMemory) => {
                    log::error!("Out of GPU memory!");
                    event_loop.exit();
                }
                Err(e) => {
                    log::warn!("Surface error: {:?}", e);
                }
            },

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let AppState::Running { window, .. } = &mut self.state else {
            event_loop.set_control_flow(ControlFlow::Wait);
            return;
        };

        // Tick at the target rate; the compositor decides per tick whether
        // anything actually renders.
        let frame_duration = Duration::from_nanos(1_000_000_000u64 / TARGET_FPS as u64);
        let now = Instant::now();

        if now >= self.next_redraw_at {
            window.request_redraw();
            self.next_redraw_at += frame_duration;

            // Reset if too far behind
            if now > self.next_redraw_at + frame_duration * 2 {
                self.next_redraw_at = now + frame_duration;
            }
        }

        event_loop.set_control_flow(ControlFlow::WaitUntil(self.next_redraw_at));
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("DotMatrix Cam v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load();

    let event_loop = EventLoop::new().expect("Failed to create event loop");
    event_loop.set_control_flow(ControlFlow::Wait);

    let mut app = DotMatrixApp::new(config);
    event_loop.run_app(&mut app).expect("Event loop error");
}
