//! Depth acquisition
//!
//! Two sources can feed the per-pixel depth/confidence signal the compositor
//! samples: a hardware depth-sensing session ([`sensor::SensorDepthProvider`])
//! or asynchronous ML segmentation ([`segmentation::SegmentationProvider`]).
//! Exactly one provider is selected at startup and lives for the whole
//! session.

pub mod segmentation;
pub mod sensor;

use thiserror::Error;

use crate::compositor::GpuContext;

pub use segmentation::SegmentationProvider;
pub use sensor::SensorDepthProvider;

/// Ceiling used to normalize 16-bit depth samples, in millimeters.
pub const MAX_DEPTH_MM: f32 = 8000.0;

/// Lifecycle stage of a depth provider. Transitions outside their valid
/// source state are silent no-ops; `Released` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderState {
    #[default]
    Uninitialized,
    Initialized,
    Resumed,
    Paused,
    Released,
}

/// How the render loop should be paced for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderCadence {
    /// Redraw every refresh; the depth source produces data continuously.
    Continuous,
    /// Redraw only when a new frame, parameter change, or capture request
    /// arrives.
    OnDemand,
}

/// A source of per-pixel depth or foreground-confidence data.
///
/// All methods are called from the render thread. GPU resources owned by the
/// provider (its depth texture) are created and destroyed here, and only ever
/// bound and sampled by the render loop.
pub trait DepthProvider {
    /// Prepare the underlying engine. Idempotent: repeat calls after success
    /// are no-ops. Failure is caught internally and leaves the provider
    /// `Uninitialized`; the render loop keeps going without depth data.
    fn initialize(&mut self, gpu: &GpuContext, width: u32, height: u32, camera_texture: &wgpu::Texture);

    /// Resume the engine. Acts only from `Initialized` or `Paused`.
    fn resume(&mut self);

    /// Pause the engine. Acts only from `Resumed`.
    fn pause(&mut self);

    /// Refresh the depth texture from the latest available data. No-op when
    /// the provider is not `Resumed` or nothing new is ready.
    fn update(&mut self, gpu: &GpuContext);

    /// The current depth texture, or `None` before the first successful
    /// update.
    fn depth_texture(&self) -> Option<&wgpu::TextureView>;

    /// Tear down engine and GPU resources. Safe to call repeatedly and from
    /// any state.
    fn release(&mut self);

    /// Render pacing for this provider.
    fn cadence(&self) -> RenderCadence;

    /// Current lifecycle stage.
    fn state(&self) -> ProviderState;

    /// Handle for the frame-analysis side, when this provider consumes
    /// camera frames.
    fn frame_analyzer(&self) -> Option<segmentation::FrameAnalyzer> {
        None
    }
}

/// Depth-estimation mode requested from a hardware session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthMode {
    Automatic,
    Disabled,
}

/// Focus mode requested from a hardware session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusMode {
    Auto,
    Fixed,
}

/// Configuration applied to a hardware depth session before first use.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub depth_mode: DepthMode,
    pub focus_mode: FocusMode,
    /// Display geometry the session renders the camera feed at.
    pub display_width: u32,
    pub display_height: u32,
}

/// One 16-bit depth frame acquired from a hardware session. Samples are
/// millimeter distances, row-major.
pub struct DepthImage16 {
    pub width: u32,
    pub height: u32,
    pub samples: Vec<u16>,
}

/// Hardware depth-session error
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session has not produced a depth frame yet. Expected while the
    /// sensor warms up; callers swallow it.
    #[error("depth data not yet available")]
    NotYetAvailable,
    #[error("depth session failure: {0}")]
    Backend(String),
}

/// Boundary to a hardware-assisted depth-sensing session.
///
/// The session owns the camera: once configured it renders the feed into the
/// shared camera texture itself, so no separate capture pipeline runs on this
/// path.
pub trait DepthSession: Send {
    /// Configure the session and hand it the camera texture to render into.
    fn configure(&mut self, config: SessionConfig, camera_texture: &wgpu::Texture) -> Result<(), SessionError>;

    /// Start or restart the session.
    fn resume(&mut self) -> Result<(), SessionError>;

    /// Suspend the session.
    fn pause(&mut self);

    /// Pull the most recent 16-bit depth frame.
    fn acquire_depth(&mut self) -> Result<DepthImage16, SessionError>;

    /// Shut the session down. Must return promptly.
    fn close(&mut self);
}

/// Single-channel GPU texture owned by a provider.
pub(crate) struct DepthTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

impl DepthTexture {
    pub(crate) fn new(
        gpu: &GpuContext,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        label: &str,
    ) -> Self {
        let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            width,
            height,
        }
    }

    pub(crate) fn matches(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }

    pub(crate) fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub(crate) fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub(crate) fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Probe for hardware depth-sensing support.
///
/// Desktop builds compile no hardware depth backend, so this returns `None`
/// and the factory falls back to segmentation. A RealSense-style backend
/// implementing [`DepthSession`] would be constructed here.
pub fn detect_session() -> Option<Box<dyn DepthSession>> {
    None
}

/// One-shot provider selection: hardware depth session when the device
/// supports one, ML segmentation otherwise. Never re-evaluated during a
/// session's lifetime.
pub fn create_provider(session: Option<Box<dyn DepthSession>>) -> Box<dyn DepthProvider> {
    match session {
        Some(session) => {
            log::info!("Hardware depth sensing available, using depth session");
            Box::new(SensorDepthProvider::new(session))
        }
        None => {
            log::info!("No depth hardware detected, using ML segmentation");
            Box::new(SegmentationProvider::new())
        }
    }
}
