//! Hardware depth-session provider
//!
//! Wraps a [`DepthSession`] that renders the camera feed into the shared
//! camera texture and yields 16-bit depth frames. Each sample is normalized
//! against a fixed millimeter ceiling and uploaded as a single-channel float
//! texture. A "not yet available" result from the session is expected
//! steady-state and ignored.

use crate::compositor::GpuContext;

use super::{
    DepthImage16, DepthMode, DepthProvider, DepthSession, DepthTexture, FocusMode, ProviderState,
    RenderCadence, SessionConfig, SessionError, MAX_DEPTH_MM,
};

pub struct SensorDepthProvider {
    session: Box<dyn DepthSession>,
    state: ProviderState,
    texture: Option<DepthTexture>,
    /// Reusable conversion buffer, grown on demand and never shrunk.
    convert_buf: Vec<f32>,
}

impl SensorDepthProvider {
    pub fn new(session: Box<dyn DepthSession>) -> Self {
        Self {
            session,
            state: ProviderState::Uninitialized,
            texture: None,
            convert_buf: Vec::new(),
        }
    }

    fn upload(&mut self, gpu: &GpuContext, image: &DepthImage16) {
        if image.samples.len() != (image.width * image.height) as usize {
            log::warn!(
                "Discarding malformed depth frame ({}x{}, {} samples)",
                image.width,
                image.height,
                image.samples.len()
            );
            return;
        }

        normalize_depth(&image.samples, &mut self.convert_buf);

        let recreate = self
            .texture
            .as_ref()
            .map_or(true, |t| !t.matches(image.width, image.height));
        if recreate {
            self.texture = Some(DepthTexture::new(
                gpu,
                image.width,
                image.height,
                wgpu::TextureFormat::R32Float,
                "Depth Texture",
            ));
        }

        if let Some(texture) = &self.texture {
            gpu.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: texture.texture(),
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                bytemuck::cast_slice(&self.convert_buf),
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(image.width * 4),
                    rows_per_image: Some(image.height),
                },
                wgpu::Extent3d {
                    width: image.width,
                    height: image.height,
                    depth_or_array_layers: 1,
                },
            );
        }
    }
}

impl DepthProvider for SensorDepthProvider {
    fn initialize(&mut self, _gpu: &GpuContext, width: u32, height: u32, camera_texture: &wgpu::Texture) {
        if self.state != ProviderState::Uninitialized {
            return;
        }

        let config = SessionConfig {
            depth_mode: DepthMode::Automatic,
            focus_mode: FocusMode::Auto,
            display_width: width,
            display_height: height,
        };

        match self.session.configure(config, camera_texture) {
            Ok(()) => {
                self.state = ProviderState::Initialized;
                log::info!("Depth session configured ({}x{})", width, height);
            }
            Err(e) => {
                log::error!("Failed to configure depth session: {}", e);
                self.session.close();
            }
        }
    }

    fn resume(&mut self) {
        if !matches!(self.state, ProviderState::Initialized | ProviderState::Paused) {
            return;
        }
        match self.session.resume() {
            Ok(()) => {
                self.state = ProviderState::Resumed;
                log::info!("Depth session resumed");
            }
            Err(e) => {
                log::error!("Failed to resume depth session: {}", e);
            }
        }
    }

    fn pause(&mut self) {
        if self.state != ProviderState::Resumed {
            return;
        }
        self.session.pause();
        self.state = ProviderState::Paused;
        log::info!("Depth session paused");
    }

    fn update(&mut self, gpu: &GpuContext) {
        if self.state != ProviderState::Resumed {
            return;
        }

        match self.session.acquire_depth() {
            Ok(image) => self.upload(gpu, &image),
            Err(SessionError::NotYetAvailable) => {}
            Err(e) => {
                log::warn!("Failed to acquire depth frame: {}", e);
            }
        }
    }

    fn depth_texture(&self) -> Option<&wgpu::TextureView> {
        self.texture.as_ref().map(|t| t.view())
    }

    fn release(&mut self) {
        if self.state == ProviderState::Released {
            return;
        }
        if self.state == ProviderState::Resumed {
            self.session.pause();
        }
        self.session.close();
        self.texture = None;
        self.state = ProviderState::Released;
        log::info!("Depth session released");
    }

    fn cadence(&self) -> RenderCadence {
        RenderCadence::Continuous
    }

    fn state(&self) -> ProviderState {
        self.state
    }
}

/// Convert 16-bit millimeter depth samples to normalized floats in [0, 1].
/// The output buffer is reused across frames; its capacity only grows.
pub(crate) fn normalize_depth(samples: &[u16], out: &mut Vec<f32>) {
    out.clear();
    out.extend(
        samples
            .iter()
            .map(|&mm| (mm as f32 / MAX_DEPTH_MM).clamp(0.0, 1.0)),
    );
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::compositor::test_gpu;

    #[derive(Default)]
    struct SessionLog {
        configure: usize,
        resume: usize,
        pause: usize,
        acquire: usize,
        close: usize,
    }

    struct MockSession {
        log: Arc<Mutex<SessionLog>>,
        fail_configure: bool,
        depth: Option<DepthImage16>,
    }

    impl MockSession {
        fn new(log: Arc<Mutex<SessionLog>>) -> Self {
            Self {
                log,
                fail_configure: false,
                depth: None,
            }
        }
    }

    impl DepthSession for MockSession {
        fn configure(
            &mut self,
            _config: SessionConfig,
            _camera_texture: &wgpu::Texture,
        ) -> Result<(), SessionError> {
            self.log.lock().configure += 1;
            if self.fail_configure {
                Err(SessionError::Backend("no depth hardware".into()))
            } else {
                Ok(())
            }
        }

        fn resume(&mut self) -> Result<(), SessionError> {
            self.log.lock().resume += 1;
            Ok(())
        }

        fn pause(&mut self) {
            self.log.lock().pause += 1;
        }

        fn acquire_depth(&mut self) -> Result<DepthImage16, SessionError> {
            self.log.lock().acquire += 1;
            match self.depth.take() {
                Some(image) => Ok(image),
                None => Err(SessionError::NotYetAvailable),
            }
        }

        fn close(&mut self) {
            self.log.lock().close += 1;
        }
    }

    fn camera_texture(gpu: &crate::compositor::GpuContext) -> wgpu::Texture {
        gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Test Camera Texture"),
            size: wgpu::Extent3d {
                width: 64,
                height: 64,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }

    #[test]
    fn normalize_clamps_to_ceiling() {
        let mut out = Vec::new();
        normalize_depth(&[0, 4000, 8000, 9500], &mut out);
        assert_eq!(out, vec![0.0, 0.5, 1.0, 1.0]);
    }

    #[test]
    fn normalize_reuses_buffer() {
        let mut out = Vec::new();
        normalize_depth(&[1000; 512], &mut out);
        let capacity = out.capacity();
        normalize_depth(&[2000; 16], &mut out);
        assert_eq!(out.len(), 16);
        assert!(out.capacity() >= capacity);
    }

    #[test]
    fn update_before_resume_does_not_poll_session() {
        let Some(gpu) = test_gpu() else {
            eprintln!("no GPU adapter available, skipping");
            return;
        };
        let log = Arc::new(Mutex::new(SessionLog::default()));
        let mut provider = SensorDepthProvider::new(Box::new(MockSession::new(log.clone())));
        provider.initialize(&gpu, 64, 64, &camera_texture(&gpu));
        assert_eq!(provider.state(), ProviderState::Initialized);

        provider.update(&gpu);

        assert_eq!(log.lock().acquire, 0);
        assert!(provider.depth_texture().is_none());
    }

    #[test]
    fn not_yet_available_is_swallowed() {
        let Some(gpu) = test_gpu() else {
            eprintln!("no GPU adapter available, skipping");
            return;
        };
        let log = Arc::new(Mutex::new(SessionLog::default()));
        let mut provider = SensorDepthProvider::new(Box::new(MockSession::new(log.clone())));
        provider.initialize(&gpu, 64, 64, &camera_texture(&gpu));
        provider.resume();
        assert_eq!(provider.state(), ProviderState::Resumed);

        provider.update(&gpu);

        assert_eq!(log.lock().acquire, 1);
        assert!(provider.depth_texture().is_none());
    }

    #[test]
    fn depth_frame_creates_texture() {
        let Some(gpu) = test_gpu() else {
            eprintln!("no GPU adapter available, skipping");
            return;
        };
        let log = Arc::new(Mutex::new(SessionLog::default()));
        let mut session = MockSession::new(log);
        session.depth = Some(DepthImage16 {
            width: 160,
            height: 120,
            samples: vec![4000; 160 * 120],
        });
        let mut provider = SensorDepthProvider::new(Box::new(session));
        provider.initialize(&gpu, 64, 64, &camera_texture(&gpu));
        provider.resume();

        provider.update(&gpu);

        assert!(provider.depth_texture().is_some());
        let texture = provider.texture.as_ref().unwrap();
        assert_eq!(texture.size(), (160, 120));
    }

    #[test]
    fn configure_failure_leaves_uninitialized() {
        let Some(gpu) = test_gpu() else {
            eprintln!("no GPU adapter available, skipping");
            return;
        };
        let log = Arc::new(Mutex::new(SessionLog::default()));
        let mut session = MockSession::new(log.clone());
        session.fail_configure = true;
        let mut provider = SensorDepthProvider::new(Box::new(session));

        provider.initialize(&gpu, 64, 64, &camera_texture(&gpu));

        assert_eq!(provider.state(), ProviderState::Uninitialized);
        assert_eq!(log.lock().close, 1);

        // Out-of-order lifecycle calls stay silent no-ops.
        provider.resume();
        provider.pause();
        assert_eq!(provider.state(), ProviderState::Uninitialized);
        assert_eq!(log.lock().resume, 0);
    }

    #[test]
    fn initialize_is_idempotent_after_success() {
        let Some(gpu) = test_gpu() else {
            eprintln!("no GPU adapter available, skipping");
            return;
        };
        let log = Arc::new(Mutex::new(SessionLog::default()));
        let mut provider = SensorDepthProvider::new(Box::new(MockSession::new(log.clone())));
        let texture = camera_texture(&gpu);

        provider.initialize(&gpu, 64, 64, &texture);
        provider.initialize(&gpu, 64, 64, &texture);

        assert_eq!(log.lock().configure, 1);
    }

    #[test]
    fn pause_resume_round_trip() {
        let Some(gpu) = test_gpu() else {
            eprintln!("no GPU adapter available, skipping");
            return;
        };
        let log = Arc::new(Mutex::new(SessionLog::default()));
        let mut provider = SensorDepthProvider::new(Box::new(MockSession::new(log.clone())));
        provider.initialize(&gpu, 64, 64, &camera_texture(&gpu));

        // pause before resume is a no-op
        provider.pause();
        assert_eq!(provider.state(), ProviderState::Initialized);
        assert_eq!(log.lock().pause, 0);

        provider.resume();
        provider.pause();
        provider.resume();
        assert_eq!(provider.state(), ProviderState::Resumed);
        assert_eq!(log.lock().resume, 2);
        assert_eq!(log.lock().pause, 1);
    }

    #[test]
    fn release_twice_is_safe() {
        let Some(gpu) = test_gpu() else {
            eprintln!("no GPU adapter available, skipping");
            return;
        };
        let log = Arc::new(Mutex::new(SessionLog::default()));
        let mut provider = SensorDepthProvider::new(Box::new(MockSession::new(log.clone())));
        provider.initialize(&gpu, 64, 64, &camera_texture(&gpu));
        provider.resume();

        provider.release();
        provider.release();

        assert_eq!(provider.state(), ProviderState::Released);
        assert!(provider.depth_texture().is_none());
        // resumed sessions are paused before closing, exactly once
        assert_eq!(log.lock().pause, 1);
        assert_eq!(log.lock().close, 1);

        // released is terminal
        provider.resume();
        assert_eq!(provider.state(), ProviderState::Released);
    }
}
