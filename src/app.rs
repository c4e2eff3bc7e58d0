//! Application state holding the window surface and the compositor
//!
//! Owns the wgpu device, the window surface and the present (blit) pass, and
//! wires the external collaborators together: the camera feed, the depth
//! provider picked once at startup, the keyboard-driven parameter source,
//! and the PNG-saving capture sink.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use glam::{Mat4, Vec3};
use winit::dpi::PhysicalSize;
use winit::window::Window;

use crate::camera::CameraFeed;
use crate::compositor::{FrameCompositor, FrameSignal, GpuContext, RenderParams};
use crate::config::AppConfig;
use crate::depth::{self, RenderCadence};

/// Foreground/background presets cycled by the number keys.
const COLOR_THEMES: [([f32; 4], [f32; 4]); 6] = [
    // black on white
    ([0.0, 0.0, 0.0, 1.0], [1.0, 1.0, 1.0, 1.0]),
    // white on black
    ([1.0, 1.0, 1.0, 1.0], [0.0, 0.0, 0.0, 1.0]),
    // red on black
    ([0.898, 0.224, 0.208, 1.0], [0.0, 0.0, 0.0, 1.0]),
    // yellow on black
    ([1.0, 0.922, 0.231, 1.0], [0.0, 0.0, 0.0, 1.0]),
    // green on black
    ([0.263, 0.627, 0.278, 1.0], [0.0, 0.0, 0.0, 1.0]),
    // blue on white
    ([0.118, 0.533, 0.898, 1.0], [1.0, 1.0, 1.0, 1.0]),
];

/// Main application state
pub struct App {
    window: Arc<Window>,
    surface: wgpu::Surface<'static>,
    gpu: GpuContext,
    surface_config: wgpu::SurfaceConfiguration,
    size: PhysicalSize<u32>,

    compositor: FrameCompositor,
    params: Arc<RenderParams>,

    blit_pipeline: wgpu::RenderPipeline,
    blit_bind_group: wgpu::BindGroup,
}

impl App {
    /// Create the wgpu context, pick the depth provider, and assemble the
    /// compositor.
    pub async fn new(window: Arc<Window>, app_config: AppConfig) -> Self {
        let size = window.inner_size();

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = instance
            .create_surface(window.clone())
            .expect("Failed to create surface");

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .expect("Failed to find suitable GPU adapter");

        log::info!("Using GPU: {}", adapter.get_info().name);
        log::info!("Backend: {:?}", adapter.get_info().backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("DotMatrix Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .expect("Failed to create device");

        let surface_caps = surface.get_capabilities(&adapter);

        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .copied()
            .unwrap_or(surface_caps.formats[0]);

        log::info!("Surface format: {:?}", surface_format);

        let present_mode = if surface_caps
            .present_modes
            .contains(&wgpu::PresentMode::Mailbox)
        {
            wgpu::PresentMode::Mailbox
        } else {
            wgpu::PresentMode::Fifo
        };

        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode,
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 1,
        };

        surface.configure(&device, &surface_config);

        let gpu = GpuContext { device, queue };

        let params = Arc::new(RenderParams::new(
            app_config.density,
            app_config.dot_size,
            app_config.distortion,
            app_config.foreground,
            app_config.background,
        ));

        // One provider per session, chosen by device capability.
        let provider = depth::create_provider(depth::detect_session());
        let frame_signal = FrameSignal::new();

        // The session-backed provider drives the camera itself; only the
        // segmentation path needs a capture pipeline.
        let camera = if provider.cadence() == RenderCadence::OnDemand {
            let available = CameraFeed::list_cameras();
            for info in &available {
                log::info!("Camera {}: {}", info.index, info.name);
            }

            let transform = if app_config.mirror {
                Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0))
                    * Mat4::from_scale(Vec3::new(-1.0, 1.0, 1.0))
            } else {
                Mat4::IDENTITY
            };

            match CameraFeed::new(
                app_config.camera_index,
                app_config.capture_width,
                app_config.capture_height,
                transform,
                Some(frame_signal.clone()),
                provider.frame_analyzer(),
            ) {
                Ok(feed) => Some(feed),
                Err(e) => {
                    log::error!("Failed to open camera: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let compositor = FrameCompositor::new(
            gpu.clone(),
            app_config.capture_width,
            app_config.capture_height,
            params.clone(),
            provider,
            camera,
            frame_signal,
        );

        // Present pass: composited output stretched over the window.
        let blit_shader = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Blit Shader"),
                source: wgpu::ShaderSource::Wgsl(include_str!("shaders/blit.wgsl").into()),
            });

        let blit_bind_group_layout =
            gpu.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("Blit Bind Group Layout"),
                    entries: &[
                        wgpu::BindGroupLayoutEntry {
                            binding: 0,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Texture {
                                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                                view_dimension: wgpu::TextureViewDimension::D2,
                                multisampled: false,
                            },
                            count: None,
                        },
                        wgpu::BindGroupLayoutEntry {
                            binding: 1,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                            count: None,
                        },
                    ],
                });

        let blit_pipeline_layout =
            gpu.device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some("Blit Pipeline Layout"),
                    bind_group_layouts: &[&blit_bind_group_layout],
                    push_constant_ranges: &[],
                });

        let blit_pipeline = gpu
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("Blit Pipeline"),
                layout: Some(&blit_pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &blit_shader,
                    entry_point: Some("vs_main"),
                    buffers: &[],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &blit_shader,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: surface_format,
                        blend: Some(wgpu::BlendState::REPLACE),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });

        let blit_sampler = gpu.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Blit Sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let blit_bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Blit Bind Group"),
            layout: &blit_bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(compositor.output_view()),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&blit_sampler),
                },
            ],
        });

        Self {
            window,
            surface,
            gpu,
            surface_config,
            size,
            compositor,
            params,
            blit_pipeline,
            blit_bind_group,
        }
    }

    /// Resize the surface
    pub fn resize(&mut self, new_size: PhysicalSize<u32>) {
        if new_size.width > 0 && new_size.height > 0 {
            self.size = new_size;
            self.surface_config.width = new_size.width;
            self.surface_config.height = new_size.height;
            self.surface.configure(&self.gpu.device, &self.surface_config);
            self.compositor.mark_dirty();
        }
    }

    /// Get current size
    pub fn size(&self) -> PhysicalSize<u32> {
        self.size
    }

    /// Host lifecycle: resume the depth provider.
    pub fn resume(&mut self) {
        self.compositor.resume();
    }

    /// Host lifecycle: pause the depth provider.
    pub fn pause(&mut self) {
        self.compositor.pause();
    }

    /// Host lifecycle: tear everything down.
    pub fn release(&mut self) {
        self.compositor.release();
    }

    /// Run the compositor when it has work, then present.
    pub fn update_and_render(&mut self) -> Result<(), wgpu::SurfaceError> {
        if !self.compositor.should_render() {
            return Ok(());
        }

        self.compositor.render_frame();

        let output = self.surface.get_current_texture()?;
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Present Encoder"),
            });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Present Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            render_pass.set_pipeline(&self.blit_pipeline);
            render_pass.set_bind_group(0, &self.blit_bind_group, &[]);
            render_pass.draw(0..3, 0..1);
        }
        self.gpu.queue.submit(std::iter::once(encoder.finish()));

        output.present();
        Ok(())
    }

    /// Nudge the dot density, clamped to the supported range.
    pub fn adjust_density(&mut self, delta: f32) {
        let value = (self.params.density() + delta).clamp(10.0, 150.0);
        self.params.set_density(value);
        self.compositor.mark_dirty();
        log::info!("Density: {:.0}", value);
    }

    /// Nudge the dot size factor, clamped to the supported range.
    pub fn adjust_dot_size(&mut self, delta: f32) {
        let value = (self.params.dot_size() + delta).clamp(0.5, 2.0);
        self.params.set_dot_size(value);
        self.compositor.mark_dirty();
        log::info!("Dot size: {:.2}", value);
    }

    /// Nudge the distortion factor, clamped to the supported range.
    pub fn adjust_distortion(&mut self, delta: f32) {
        let value = (self.params.distortion() + delta).clamp(0.0, 1.0);
        self.params.set_distortion(value);
        self.compositor.mark_dirty();
        log::info!("Distortion: {:.2}", value);
    }

    /// Apply one of the color presets.
    pub fn select_theme(&mut self, index: usize) {
        let (foreground, background) = COLOR_THEMES[index % COLOR_THEMES.len()];
        self.params.set_foreground(foreground);
        self.params.set_background(background);
        self.compositor.mark_dirty();
        log::info!("Color theme {}", index + 1);
    }

    /// Capture the next composited frame and hand it to the PNG sink.
    pub fn capture_photo(&mut self) {
        self.compositor.capture_frame(save_still);
        log::info!("Capture requested");
    }

    /// Request a redraw from the event loop.
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

/// Capture sink: writes the still as a timestamped PNG in the working
/// directory. Runs on the capture-delivery thread; failures stay here.
fn save_still(image: image::RgbaImage) {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let path = format!("dotmatrix-{}.png", stamp);

    match image.save(&path) {
        Ok(()) => log::info!("Saved capture to {}", path),
        Err(e) => log::error!("Failed to save capture: {}", e),
    }
}
