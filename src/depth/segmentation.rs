//! ML segmentation provider
//!
//! Runs selfie segmentation through ONNX Runtime on a dedicated inference
//! thread. The capture side submits frames through a [`FrameAnalyzer`]; while
//! an inference is in flight further frames are dropped without blocking.
//! Results are converted to confidence bytes and placed in a single-slot
//! mailbox that the render thread drains into the mask texture - newest
//! result wins, each result is applied at most once.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use crossbeam_channel::{Receiver, Sender};
use ndarray::Array4;
use parking_lot::Mutex;

use crate::camera::CameraFrame;
use crate::compositor::GpuContext;

use super::{DepthProvider, DepthTexture, ProviderState, RenderCadence};

/// Input and output resolution of the segmentation model.
pub const MASK_WIDTH: u32 = 256;
pub const MASK_HEIGHT: u32 = 256;

const MODEL_NAME: &str = "selfie_segmentation.onnx";

/// Single-slot holder for the most recent value. New writes overwrite an
/// unconsumed value; `take` clears the slot so nothing is delivered twice.
pub(crate) struct Mailbox<T> {
    slot: Mutex<Option<T>>,
}

impl<T> Mailbox<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub(crate) fn store(&self, value: T) {
        *self.slot.lock() = Some(value);
    }

    pub(crate) fn take(&self) -> Option<T> {
        self.slot.lock().take()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }
}

/// Converted confidence mask ready for texture upload.
pub(crate) struct MaskBuffer {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Frame submitted for inference.
struct FrameData {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

/// State shared between the analyzer side, the inference thread, and the
/// provider on the render thread.
pub(crate) struct SegShared {
    pub(crate) mailbox: Mailbox<MaskBuffer>,
    in_flight: AtomicBool,
    engine_ready: AtomicBool,
    running: AtomicBool,
}

/// Handle given to the frame-analysis side. Cheap to clone; safe to call from
/// the capture thread.
#[derive(Clone)]
pub struct FrameAnalyzer {
    shared: Arc<SegShared>,
    sender: Sender<FrameData>,
}

impl FrameAnalyzer {
    /// Submit one upright camera frame for foreground-confidence inference.
    ///
    /// If an inference is already in flight the frame is silently dropped;
    /// this never blocks. The caller keeps ownership of its frame buffer.
    pub fn send_frame(&self, frame: &CameraFrame) {
        if !self.shared.engine_ready.load(Ordering::Acquire) {
            return;
        }
        if self.shared.in_flight.swap(true, Ordering::AcqRel) {
            return;
        }

        let sent = self
            .sender
            .try_send(FrameData {
                data: frame.data.clone(),
                width: frame.width,
                height: frame.height,
            })
            .is_ok();
        if !sent {
            self.shared.in_flight.store(false, Ordering::Release);
        }
    }
}

pub struct SegmentationProvider {
    state: ProviderState,
    shared: Arc<SegShared>,
    sender: Sender<FrameData>,
    receiver: Option<Receiver<FrameData>>,
    thread_handle: Option<std::thread::JoinHandle<()>>,
    texture: Option<DepthTexture>,
}

impl SegmentationProvider {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::bounded::<FrameData>(1);
        Self {
            state: ProviderState::Uninitialized,
            shared: Arc::new(SegShared {
                mailbox: Mailbox::new(),
                in_flight: AtomicBool::new(false),
                engine_ready: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
            sender,
            receiver: Some(receiver),
            thread_handle: None,
            texture: None,
        }
    }

    /// Dimensions of the current mask texture.
    pub fn mask_size(&self) -> Option<(u32, u32)> {
        self.texture.as_ref().map(|t| t.size())
    }

    fn analyzer(&self) -> FrameAnalyzer {
        FrameAnalyzer {
            shared: self.shared.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl Default for SegmentationProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DepthProvider for SegmentationProvider {
    fn initialize(&mut self, _gpu: &GpuContext, _width: u32, _height: u32, _camera_texture: &wgpu::Texture) {
        if self.state != ProviderState::Uninitialized {
            return;
        }

        let session = match init_engine() {
            Ok(session) => session,
            Err(e) => {
                log::warn!("Failed to initialize segmentation engine: {:#}", e);
                return;
            }
        };

        let Some(receiver) = self.receiver.take() else {
            return;
        };

        self.shared.running.store(true, Ordering::Release);
        let shared = self.shared.clone();
        match std::thread::Builder::new()
            .name("segmentation-inference".to_string())
            .spawn(move || inference_thread(session, receiver, shared))
        {
            Ok(handle) => {
                self.thread_handle = Some(handle);
                self.shared.engine_ready.store(true, Ordering::Release);
                self.state = ProviderState::Initialized;
                log::info!("Segmentation engine initialized");
            }
            Err(e) => {
                log::error!("Failed to spawn inference thread: {}", e);
                self.shared.running.store(false, Ordering::Release);
            }
        }
    }

    fn resume(&mut self) {
        if matches!(self.state, ProviderState::Initialized | ProviderState::Paused) {
            self.state = ProviderState::Resumed;
        }
    }

    fn pause(&mut self) {
        if self.state == ProviderState::Resumed {
            self.state = ProviderState::Paused;
        }
    }

    fn update(&mut self, gpu: &GpuContext) {
        if self.state != ProviderState::Resumed {
            return;
        }

        let Some(mask) = self.shared.mailbox.take() else {
            return;
        };
        if mask.width == 0 || mask.height == 0 || mask.data.len() != (mask.width * mask.height) as usize {
            log::warn!("Discarding malformed mask buffer ({}x{})", mask.width, mask.height);
            return;
        }

        // Mask dimensions come from the inference result, not the camera, so
        // the texture is respecified whenever they change.
        let recreate = self
            .texture
            .as_ref()
            .map_or(true, |t| !t.matches(mask.width, mask.height));
        if recreate {
            self.texture = Some(DepthTexture::new(
                gpu,
                mask.width,
                mask.height,
                wgpu::TextureFormat::R8Unorm,
                "Segmentation Mask Texture",
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
                &mask.data,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(mask.width),
                    rows_per_image: Some(mask.height),
                },
                wgpu::Extent3d {
                    width: mask.width,
                    height: mask.height,
                    depth_or_array_layers: 1,
                },
            );
        }
    }

    fn depth_texture(&self) -> Option<&wgpu::TextureView> {
        self.texture.as_ref().map(|t| t.view())
    }

    fn release(&mut self) {
        if self.state == ProviderState::Released {
            return;
        }
        self.shared.engine_ready.store(false, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.texture = None;
        self.state = ProviderState::Released;
        log::info!("Segmentation engine released");
    }

    fn cadence(&self) -> RenderCadence {
        RenderCadence::OnDemand
    }

    fn state(&self) -> ProviderState {
        self.state
    }

    fn frame_analyzer(&self) -> Option<FrameAnalyzer> {
        Some(self.analyzer())
    }
}

/// Convert confidence values in [0, 1] to bytes and overwrite the mailbox.
/// Called from the inference thread; a freshly allocated buffer replaces any
/// unconsumed previous result.
pub(crate) fn publish_mask(shared: &SegShared, confidences: &[f32], width: u32, height: u32) {
    let mut data = Vec::with_capacity(confidences.len());
    data.extend(
        confidences
            .iter()
            .map(|&c| ((c * 255.0) as i32).clamp(0, 255) as u8),
    );
    shared.mailbox.store(MaskBuffer {
        data,
        width,
        height,
    });
}

/// Inference thread main loop. Exits when the channel disconnects or the
/// running flag clears; the timeout bounds how long release() can wait.
fn inference_thread(
    mut session: ort::session::Session,
    receiver: Receiver<FrameData>,
    shared: Arc<SegShared>,
) {
    log::info!("Segmentation inference thread started");

    loop {
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(frame) => {
                match run_segmentation(&mut session, &frame) {
                    Ok(confidences) => {
                        publish_mask(&shared, &confidences, MASK_WIDTH, MASK_HEIGHT)
                    }
                    Err(e) => log::warn!("Inference failed: {:#}", e),
                }
                shared.in_flight.store(false, Ordering::Release);
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
    }

    log::info!("Segmentation inference thread stopped");
}

/// Initialize ONNX Runtime and load the segmentation model.
fn init_engine() -> anyhow::Result<ort::session::Session> {
    let model_dir = find_model_dir()?;
    let model_path = model_dir.join(MODEL_NAME);
    anyhow::ensure!(
        model_path.exists(),
        "segmentation model not found: {:?}",
        model_path
    );

    ort::init()
        .with_name("DotMatrixCam")
        .commit()
        .context("failed to initialize ONNX Runtime")?;

    let session = ort::session::Session::builder()
        .context("failed to create session builder")?
        .with_intra_threads(2)
        .context("failed to set intra threads")?
        .commit_from_file(&model_path)
        .context("failed to load segmentation model")?;

    log::info!("Loaded segmentation model from {:?}", model_path);
    Ok(session)
}

/// Find the models directory: walk up from the executable, then try the
/// working directory.
fn find_model_dir() -> anyhow::Result<PathBuf> {
    if let Ok(exe_path) = std::env::current_exe() {
        let mut dir = exe_path.parent().map(|p| p.to_path_buf());
        while let Some(d) = dir {
            let candidate = d.join("models");
            if candidate.exists() {
                return Ok(candidate);
            }
            dir = d.parent().map(|p| p.to_path_buf());
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("models");
    if candidate.exists() {
        return Ok(candidate);
    }

    anyhow::bail!("models directory not found; create a 'models' directory with the ONNX model")
}

/// Run one segmentation pass, returning confidences clamped to [0, 1].
fn run_segmentation(
    session: &mut ort::session::Session,
    frame: &FrameData,
) -> anyhow::Result<Vec<f32>> {
    let input = preprocess_rgba_nhwc(&frame.data, frame.width, frame.height, MASK_WIDTH, MASK_HEIGHT);

    // NHWC (1, 256, 256, 3), what the selfie segmentation model expects
    let input_array = Array4::from_shape_vec(
        (1, MASK_HEIGHT as usize, MASK_WIDTH as usize, 3),
        input,
    )
    .context("failed to shape input array")?;

    let input_tensor =
        ort::value::Tensor::from_array(input_array).context("failed to create input tensor")?;

    let outputs = session
        .run(ort::inputs![input_tensor])
        .context("inference run failed")?;

    let output = outputs
        .iter()
        .next()
        .context("segmentation model produced no output")?;

    let (_shape, data) = output
        .1
        .try_extract_tensor::<f32>()
        .context("failed to extract confidence mask")?;

    Ok(data.iter().map(|&v| v.clamp(0.0, 1.0)).collect())
}

/// Nearest-neighbour resize of an RGBA frame into RGB floats in [0, 1],
/// HWC layout.
fn preprocess_rgba_nhwc(
    data: &[u8],
    src_width: u32,
    src_height: u32,
    dst_width: u32,
    dst_height: u32,
) -> Vec<f32> {
    let mut output = vec![0.0f32; (dst_width * dst_height * 3) as usize];

    let x_ratio = src_width as f32 / dst_width as f32;
    let y_ratio = src_height as f32 / dst_height as f32;

    for y in 0..dst_height {
        for x in 0..dst_width {
            let src_x = (x as f32 * x_ratio) as u32;
            let src_y = (y as f32 * y_ratio) as u32;
            let src_idx = ((src_y * src_width + src_x) * 4) as usize;

            if src_idx + 2 < data.len() {
                let out_idx = ((y * dst_width + x) * 3) as usize;
                output[out_idx] = data[src_idx] as f32 / 255.0;
                output[out_idx + 1] = data[src_idx + 1] as f32 / 255.0;
                output[out_idx + 2] = data[src_idx + 2] as f32 / 255.0;
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use glam::Mat4;

    use super::*;
    use crate::compositor::{test_gpu, FrameCompositor, FrameSignal, RenderParams};

    fn test_frame(width: u32, height: u32) -> CameraFrame {
        CameraFrame {
            data: vec![128u8; (width * height * 4) as usize],
            width,
            height,
            frame_number: 0,
        }
    }

    #[test]
    fn mailbox_overwrites_and_consumes_once() {
        let mailbox = Mailbox::new();
        mailbox.store(1u32);
        mailbox.store(2u32);

        assert_eq!(mailbox.take(), Some(2));
        assert_eq!(mailbox.take(), None);
        assert!(mailbox.is_empty());
    }

    #[test]
    fn publish_scales_and_clamps_confidences() {
        let provider = SegmentationProvider::new();
        publish_mask(&provider.shared, &[-0.5, 0.0, 0.5, 1.0, 1.5], 5, 1);

        let mask = provider.shared.mailbox.take().unwrap();
        assert_eq!(mask.data, vec![0, 0, 127, 255, 255]);
        assert_eq!((mask.width, mask.height), (5, 1));
    }

    #[test]
    fn publish_overwrites_unconsumed_result() {
        let provider = SegmentationProvider::new();
        publish_mask(&provider.shared, &[0.0; 4], 2, 2);
        publish_mask(&provider.shared, &[1.0; 4], 2, 2);

        let mask = provider.shared.mailbox.take().unwrap();
        assert_eq!(mask.data, vec![255; 4]);
        assert!(provider.shared.mailbox.is_empty());
    }

    #[test]
    fn send_frame_drops_while_in_flight() {
        let provider = SegmentationProvider::new();
        let receiver = provider.receiver.as_ref().unwrap().clone();
        provider.shared.engine_ready.store(true, Ordering::Release);
        let analyzer = provider.analyzer();

        analyzer.send_frame(&test_frame(4, 4));
        assert!(provider.shared.in_flight.load(Ordering::Acquire));
        assert_eq!(receiver.len(), 1);

        // still in flight: this frame is dropped, nothing queued
        analyzer.send_frame(&test_frame(4, 4));
        assert_eq!(receiver.len(), 1);

        // consuming the frame and clearing the flag re-opens the path
        receiver.try_recv().unwrap();
        provider.shared.in_flight.store(false, Ordering::Release);
        analyzer.send_frame(&test_frame(4, 4));
        assert_eq!(receiver.len(), 1);
    }

    #[test]
    fn send_frame_ignored_before_engine_ready() {
        let provider = SegmentationProvider::new();
        let receiver = provider.receiver.as_ref().unwrap().clone();
        let analyzer = provider.analyzer();

        analyzer.send_frame(&test_frame(4, 4));

        assert_eq!(receiver.len(), 0);
        assert!(!provider.shared.in_flight.load(Ordering::Acquire));
    }

    #[test]
    fn preprocess_produces_normalized_rgb() {
        let frame = test_frame(8, 8);
        let out = preprocess_rgba_nhwc(&frame.data, 8, 8, 4, 4);
        assert_eq!(out.len(), 4 * 4 * 3);
        assert!(out.iter().all(|&v| (v - 128.0 / 255.0).abs() < 1e-6));
    }

    #[test]
    fn update_consumes_mailbox_once() {
        let Some(gpu) = test_gpu() else {
            eprintln!("no GPU adapter available, skipping");
            return;
        };
        let mut provider = SegmentationProvider::new();
        provider.state = ProviderState::Resumed;
        publish_mask(&provider.shared, &vec![1.0f32; (MASK_WIDTH * MASK_HEIGHT) as usize], MASK_WIDTH, MASK_HEIGHT);

        provider.update(&gpu);

        assert!(provider.shared.mailbox.is_empty());
        assert_eq!(provider.mask_size(), Some((MASK_WIDTH, MASK_HEIGHT)));
        assert!(provider.depth_texture().is_some());

        // nothing new: the same result is never applied twice
        provider.update(&gpu);
        assert!(provider.shared.mailbox.is_empty());
    }

    #[test]
    fn update_before_resume_leaves_mailbox_untouched() {
        let Some(gpu) = test_gpu() else {
            eprintln!("no GPU adapter available, skipping");
            return;
        };
        let mut provider = SegmentationProvider::new();
        publish_mask(&provider.shared, &[1.0; 16], 4, 4);

        provider.update(&gpu);

        assert!(!provider.shared.mailbox.is_empty());
        assert!(provider.depth_texture().is_none());
    }

    #[test]
    fn release_twice_resets_texture() {
        let Some(gpu) = test_gpu() else {
            eprintln!("no GPU adapter available, skipping");
            return;
        };
        let mut provider = SegmentationProvider::new();
        provider.state = ProviderState::Resumed;
        publish_mask(&provider.shared, &[1.0; 16], 4, 4);
        provider.update(&gpu);
        assert!(provider.depth_texture().is_some());

        provider.release();
        provider.release();

        assert_eq!(provider.state(), ProviderState::Released);
        assert!(provider.depth_texture().is_none());
    }

    /// End-to-end: a compositor over the segmentation provider at 640x480,
    /// one camera frame submitted, one simulated uniform-confidence result.
    #[test]
    fn uniform_mask_flows_through_compositor() {
        let Some(gpu) = test_gpu() else {
            eprintln!("no GPU adapter available, skipping");
            return;
        };

        let mut provider = SegmentationProvider::new();
        provider.state = ProviderState::Resumed;
        let shared = provider.shared.clone();

        // the inference side reports a uniform full-confidence 256x256 mask
        publish_mask(&shared, &vec![1.0f32; 256 * 256], 256, 256);
        let mask = shared.mailbox.take().unwrap();
        assert_eq!(mask.data.len(), 65_536);
        assert!(mask.data.iter().all(|&b| b == 255));
        assert_eq!((mask.width, mask.height), (256, 256));
        shared.mailbox.store(mask);

        let params = Arc::new(RenderParams::default());
        let signal = FrameSignal::new();
        let mut compositor = FrameCompositor::new(
            gpu,
            640,
            480,
            params,
            Box::new(provider),
            None,
            signal,
        );

        compositor.ingest_camera_frame(&test_frame(640, 480), Mat4::IDENTITY);
        compositor.render_frame();

        assert!(shared.mailbox.is_empty());
        assert!(compositor.provider().depth_texture().is_some());
    }
}
