//! Frame compositing
//!
//! [`FrameCompositor`] owns the render loop: the camera texture, the
//! dot-matrix pipeline, the shared render parameters, the capture slot, and
//! the single depth provider fixed at construction. Every pass samples the
//! camera and depth/mask textures, writes the shader uniforms, and issues one
//! full-screen draw into an offscreen output texture that the host blits to
//! the window.

pub mod capture;
pub mod params;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use parking_lot::Mutex;

use crate::camera::{CameraFeed, CameraFrame};
use crate::depth::{DepthProvider, RenderCadence};

pub use capture::CaptureSlot;
pub use params::{RenderParams, DEFAULT_DENSITY};

/// Cloneable handles to the wgpu device and queue.
#[derive(Clone)]
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

/// New-frame signal between the capture thread and the render loop.
///
/// The producer stores the texture transform and sets the pending flag in one
/// short critical section; the render thread consumes flag and transform in
/// another. The pixel data itself travels through the camera feed's buffers,
/// written by exactly one producer and read by the render loop.
pub struct FrameSignal {
    state: Mutex<SignalState>,
}

struct SignalState {
    pending: bool,
    transform: Mat4,
}

impl FrameSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SignalState {
                pending: false,
                transform: Mat4::IDENTITY,
            }),
        })
    }

    /// Announce a new frame. Called once per frame by the capture side.
    pub fn notify(&self, transform: Mat4) {
        let mut state = self.state.lock();
        state.pending = true;
        state.transform = transform;
    }

    /// Whether a frame is waiting to be consumed.
    pub fn pending(&self) -> bool {
        self.state.lock().pending
    }

    fn consume(&self) -> Option<Mat4> {
        let mut state = self.state.lock();
        if state.pending {
            state.pending = false;
            Some(state.transform)
        } else {
            None
        }
    }
}

/// Uniform block consumed by the dot-matrix shader. Layout mirrors the
/// `Uniforms` struct in `shaders/dot_matrix.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct DotMatrixUniforms {
    transform: [[f32; 4]; 4],
    foreground: [f32; 4],
    background: [f32; 4],
    resolution: [f32; 2],
    density: f32,
    dot_size: f32,
    distortion: f32,
    _pad: [f32; 3],
}

/// The render-loop owner combining camera and depth textures each frame.
pub struct FrameCompositor {
    gpu: GpuContext,
    width: u32,
    height: u32,

    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    sampler: wgpu::Sampler,

    // Offscreen render target; also the capture readback source.
    output_texture: wgpu::Texture,
    output_view: wgpu::TextureView,

    camera_texture: wgpu::Texture,
    camera_view: wgpu::TextureView,

    // Bound in place of the provider's texture until one exists.
    _fallback_mask: wgpu::Texture,
    fallback_mask_view: wgpu::TextureView,

    transform: Mat4,
    first_frame_seen: bool,
    frame_signal: Arc<FrameSignal>,
    dirty: AtomicBool,

    params: Arc<RenderParams>,
    capture: Arc<CaptureSlot>,

    provider: Box<dyn DepthProvider>,
    camera: Option<CameraFeed>,

    frame_count: u64,
    released: bool,
}

impl FrameCompositor {
    /// Build the GPU resources and initialize the provider. The provider is
    /// fixed for the compositor's lifetime.
    pub fn new(
        gpu: GpuContext,
        width: u32,
        height: u32,
        params: Arc<RenderParams>,
        mut provider: Box<dyn DepthProvider>,
        camera: Option<CameraFeed>,
        frame_signal: Arc<FrameSignal>,
    ) -> Self {
        let shader = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Dot Matrix Shader"),
                source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/dot_matrix.wgsl").into()),
            });

        let bind_group_layout =
            gpu.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("Dot Matrix Bind Group Layout"),
                    entries: &[
                        // Camera texture
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
                        // Sampler
                        wgpu::BindGroupLayoutEntry {
                            binding: 1,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                            count: None,
                        },
                        // Depth/mask texture (R32Float is not filterable)
                        wgpu::BindGroupLayoutEntry {
                            binding: 2,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Texture {
                                sample_type: wgpu::TextureSampleType::Float { filterable: false },
                                view_dimension: wgpu::TextureViewDimension::D2,
                                multisampled: false,
                            },
                            count: None,
                        },
                        // Uniforms
                        wgpu::BindGroupLayoutEntry {
                            binding: 3,
                            visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Buffer {
                                ty: wgpu::BufferBindingType::Uniform,
                                has_dynamic_offset: false,
                                min_binding_size: None,
                            },
                            count: None,
                        },
                    ],
                });

        let pipeline_layout = gpu
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Dot Matrix Pipeline Layout"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });

        let pipeline = gpu
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("Dot Matrix Pipeline"),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    buffers: &[],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: wgpu::TextureFormat::Rgba8Unorm,
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

        let uniform_buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Dot Matrix Uniform Buffer"),
            size: std::mem::size_of::<DotMatrixUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let sampler = gpu.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Camera Sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            ..Default::default()
        });

        let output_texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Output Texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let output_view = output_texture.create_view(&wgpu::TextureViewDescriptor::default());

        let (camera_texture, camera_view) = create_camera_texture(&gpu, width, height);

        // 1x1 full-confidence placeholder so the pipeline always has a mask
        // to sample before the provider produces one.
        let fallback_mask = gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Fallback Mask Texture"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &fallback_mask,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &[255u8],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(1),
                rows_per_image: Some(1),
            },
            wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
        let fallback_mask_view = fallback_mask.create_view(&wgpu::TextureViewDescriptor::default());

        provider.initialize(&gpu, width, height, &camera_texture);

        Self {
            gpu,
            width,
            height,
            pipeline,
            bind_group_layout,
            uniform_buffer,
            sampler,
            output_texture,
            output_view,
            camera_texture,
            camera_view,
            _fallback_mask: fallback_mask,
            fallback_mask_view,
            transform: Mat4::IDENTITY,
            first_frame_seen: false,
            frame_signal,
            dirty: AtomicBool::new(false),
            params,
            capture: Arc::new(CaptureSlot::new()),
            provider,
            camera,
            frame_count: 0,
            released: false,
        }
    }

    /// Output size in pixels.
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// The composited output, for the present pass.
    pub fn output_view(&self) -> &wgpu::TextureView {
        &self.output_view
    }

    /// Shared render parameters.
    pub fn params(&self) -> &Arc<RenderParams> {
        &self.params
    }

    /// The active depth provider.
    pub fn provider(&self) -> &dyn DepthProvider {
        self.provider.as_ref()
    }

    /// Signal consumed at the top of every pass.
    pub fn frame_signal(&self) -> Arc<FrameSignal> {
        self.frame_signal.clone()
    }

    /// Frames rendered so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Request a still of the next composited frame. A request made before
    /// the previous one was serviced replaces it; only the newest callback
    /// ever fires.
    pub fn capture_frame(&self, callback: impl FnOnce(image::RgbaImage) + Send + 'static) {
        self.capture.request(callback);
        self.mark_dirty();
    }

    /// Ask for a render on the next tick (parameter change, capture request).
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Whether the next tick should render. Session-backed providers render
    /// every refresh; the segmentation path renders only when something
    /// changed.
    pub fn should_render(&self) -> bool {
        if self.released {
            return false;
        }
        match self.provider.cadence() {
            RenderCadence::Continuous => true,
            RenderCadence::OnDemand => {
                self.frame_signal.pending()
                    || self.dirty.load(Ordering::Acquire)
                    || self.capture.is_pending()
            }
        }
    }

    /// Resume the depth provider (host lifecycle).
    pub fn resume(&mut self) {
        self.provider.resume();
    }

    /// Pause the depth provider (host lifecycle).
    pub fn pause(&mut self) {
        self.provider.pause();
    }

    /// Tear everything down. Safe to call repeatedly; rendering becomes a
    /// no-op afterwards.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        if let Some(mut feed) = self.camera.take() {
            feed.stop();
        }
        self.provider.release();
        self.released = true;
        log::info!("Compositor released");
    }

    /// Upload one camera frame and adopt its texture transform.
    pub(crate) fn ingest_camera_frame(&mut self, frame: &CameraFrame, transform: Mat4) {
        self.transform = transform;

        let size = self.camera_texture.size();
        if size.width != frame.width || size.height != frame.height {
            log::info!("Recreating camera texture: {}x{}", frame.width, frame.height);
            let (texture, view) = create_camera_texture(&self.gpu, frame.width, frame.height);
            self.camera_texture = texture;
            self.camera_view = view;
        }

        self.gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.camera_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &frame.data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(frame.width * 4),
                rows_per_image: Some(frame.height),
            },
            wgpu::Extent3d {
                width: frame.width,
                height: frame.height,
                depth_or_array_layers: 1,
            },
        );

        self.first_frame_seen = true;
    }

    /// Run one frame of the render sequence.
    pub fn render_frame(&mut self) {
        if self.released {
            return;
        }

        // 1. Consume the new-frame signal: transform first, then pixels.
        if let Some(transform) = self.frame_signal.consume() {
            let frame = self.camera.as_ref().and_then(|feed| feed.latest_frame());
            match frame {
                Some(frame) => self.ingest_camera_frame(&frame, transform),
                None => {
                    // Session-backed feeds render straight into the camera
                    // texture; only the transform travels through the signal.
                    self.transform = transform;
                    self.first_frame_seen = true;
                }
            }
        }

        // 2. Let the provider refresh its depth texture.
        self.provider.update(&self.gpu);

        // 3. Frames arrive asynchronously on the segmentation path; drawing
        // before the first one would sample an unpopulated texture.
        if self.provider.cadence() == RenderCadence::OnDemand && !self.first_frame_seen {
            self.dirty.store(false, Ordering::Release);
            return;
        }

        // 4-5. Bind textures and write this frame's uniforms.
        let snapshot = self.params.snapshot();
        let uniforms = DotMatrixUniforms {
            transform: self.transform.to_cols_array_2d(),
            foreground: snapshot.foreground,
            background: snapshot.background,
            resolution: [self.width as f32, self.height as f32],
            density: params::resolve_density(snapshot.density),
            dot_size: snapshot.dot_size,
            distortion: snapshot.distortion,
            _pad: [0.0; 3],
        };
        self.gpu
            .queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));

        let mask_view = self
            .provider
            .depth_texture()
            .unwrap_or(&self.fallback_mask_view);

        let bind_group = self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Dot Matrix Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&self.camera_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(mask_view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
            ],
        });

        // 6. One full-screen draw through the dot-matrix shader.
        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Compositor Encoder"),
            });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Dot Matrix Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.output_view,
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

            render_pass.set_pipeline(&self.pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.draw(0..3, 0..1);
        }
        self.gpu.queue.submit(std::iter::once(encoder.finish()));

        // 7. Service at most one pending capture.
        if let Some(callback) = self.capture.take() {
            capture::deliver_still(
                &self.gpu,
                &self.output_texture,
                self.width,
                self.height,
                callback,
            );
        }

        self.frame_count += 1;
        self.dirty.store(false, Ordering::Release);
    }
}

impl Drop for FrameCompositor {
    fn drop(&mut self) {
        self.release();
    }
}

fn create_camera_texture(gpu: &GpuContext, width: u32, height: u32) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Camera Texture"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8Unorm,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

/// Headless device for GPU-dependent tests. Returns `None` when the machine
/// has no usable adapter, in which case those tests skip.
#[cfg(test)]
pub(crate) fn test_gpu() -> Option<GpuContext> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::LowPower,
        compatible_surface: None,
        force_fallback_adapter: false,
    }))?;
    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("Test Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults(),
            memory_hints: wgpu::MemoryHints::default(),
        },
        None,
    ))
    .ok()?;
    Some(GpuContext { device, queue })
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::depth::SegmentationProvider;

    fn test_frame(width: u32, height: u32) -> CameraFrame {
        CameraFrame {
            data: vec![200u8; (width * height * 4) as usize],
            width,
            height,
            frame_number: 0,
        }
    }

    fn test_compositor(gpu: GpuContext, width: u32, height: u32) -> FrameCompositor {
        let params = Arc::new(RenderParams::default());
        let signal = FrameSignal::new();
        FrameCompositor::new(
            gpu,
            width,
            height,
            params,
            Box::new(SegmentationProvider::new()),
            None,
            signal,
        )
    }

    #[test]
    fn frame_signal_consumes_once() {
        let signal = FrameSignal::new();
        assert!(!signal.pending());

        signal.notify(Mat4::IDENTITY);
        signal.notify(Mat4::from_scale(glam::Vec3::new(-1.0, 1.0, 1.0)));
        assert!(signal.pending());

        let transform = signal.consume().unwrap();
        assert_eq!(transform, Mat4::from_scale(glam::Vec3::new(-1.0, 1.0, 1.0)));
        assert!(signal.consume().is_none());
        assert!(!signal.pending());
    }

    #[test]
    fn render_across_parameter_ranges() {
        let Some(gpu) = test_gpu() else {
            eprintln!("no GPU adapter available, skipping");
            return;
        };
        let mut compositor = test_compositor(gpu, 320, 240);
        compositor.ingest_camera_frame(&test_frame(320, 240), Mat4::IDENTITY);

        for density in [10.0, 50.0, 150.0] {
            for dot_size in [0.5, 1.0, 2.0] {
                for distortion in [0.0, 0.5, 1.0] {
                    compositor.params().set_density(density);
                    compositor.params().set_dot_size(dot_size);
                    compositor.params().set_distortion(distortion);
                    compositor.render_frame();
                }
            }
        }

        assert_eq!(compositor.frame_count(), 27);
    }

    #[test]
    fn on_demand_guard_skips_until_first_frame() {
        let Some(gpu) = test_gpu() else {
            eprintln!("no GPU adapter available, skipping");
            return;
        };
        let mut compositor = test_compositor(gpu, 320, 240);

        // no camera frame yet: the pass bails before drawing
        compositor.render_frame();
        assert_eq!(compositor.frame_count(), 0);

        compositor.ingest_camera_frame(&test_frame(320, 240), Mat4::IDENTITY);
        compositor.render_frame();
        assert_eq!(compositor.frame_count(), 1);
    }

    #[test]
    fn dirty_flag_drives_on_demand_cadence() {
        let Some(gpu) = test_gpu() else {
            eprintln!("no GPU adapter available, skipping");
            return;
        };
        let mut compositor = test_compositor(gpu, 320, 240);
        compositor.ingest_camera_frame(&test_frame(320, 240), Mat4::IDENTITY);
        compositor.render_frame();

        assert!(!compositor.should_render());

        compositor.mark_dirty();
        assert!(compositor.should_render());
        compositor.render_frame();
        assert!(!compositor.should_render());

        compositor.frame_signal().notify(Mat4::IDENTITY);
        assert!(compositor.should_render());
    }

    #[test]
    fn latest_capture_request_fires_exactly_once() {
        let Some(gpu) = test_gpu() else {
            eprintln!("no GPU adapter available, skipping");
            return;
        };
        let mut compositor = test_compositor(gpu, 64, 64);
        compositor.ingest_camera_frame(&test_frame(64, 64), Mat4::IDENTITY);

        let (first_tx, first_rx) = mpsc::channel();
        let (second_tx, second_rx) = mpsc::channel();
        compositor.capture_frame(move |image| {
            let _ = first_tx.send((image.width(), image.height()));
        });
        compositor.capture_frame(move |image| {
            let _ = second_tx.send((image.width(), image.height()));
        });

        compositor.render_frame();

        let (width, height) = second_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("newest capture callback should fire");
        assert_eq!((width, height), (64, 64));
        assert!(first_rx.recv_timeout(Duration::from_millis(200)).is_err());

        // no new request: another pass must not redeliver
        compositor.render_frame();
        assert!(second_rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn release_twice_stops_rendering() {
        let Some(gpu) = test_gpu() else {
            eprintln!("no GPU adapter available, skipping");
            return;
        };
        let mut compositor = test_compositor(gpu, 64, 64);
        compositor.ingest_camera_frame(&test_frame(64, 64), Mat4::IDENTITY);
        compositor.render_frame();

        compositor.release();
        compositor.release();

        assert!(compositor.provider().depth_texture().is_none());
        assert!(!compositor.should_render());
        compositor.render_frame();
        assert_eq!(compositor.frame_count(), 1);
    }
}
