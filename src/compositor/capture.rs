//! Still-image capture
//!
//! A single-slot hand-off between arbitrary callers and the render loop. The
//! slot holds at most one pending callback; a new request before the next
//! render pass replaces the old one, and consumption removes callback and
//! pending flag in one step so a callback can never fire twice.
//!
//! Readback copies the composited output into a staging buffer (rows padded
//! to wgpu's copy alignment), strips the padding while flipping the image
//! vertically, and delivers the packaged still on a detached thread.

use parking_lot::Mutex;

use super::GpuContext;

/// One-shot callback receiving the packaged still image.
pub type CaptureCallback = Box<dyn FnOnce(image::RgbaImage) + Send + 'static>;

/// Single-slot capture request holder.
pub struct CaptureSlot {
    slot: Mutex<Option<CaptureCallback>>,
}

impl CaptureSlot {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Register a capture request. An unserviced earlier request is replaced;
    /// the last writer before the next render pass wins.
    pub fn request(&self, callback: impl FnOnce(image::RgbaImage) + Send + 'static) {
        *self.slot.lock() = Some(Box::new(callback));
    }

    /// Whether a request is waiting for the next render pass.
    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Consume the pending request. Clearing the slot and handing out the
    /// callback is one step, so delivery is at most once.
    pub(crate) fn take(&self) -> Option<CaptureCallback> {
        self.slot.lock().take()
    }
}

impl Default for CaptureSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the composited output back, package it, and invoke the callback on a
/// detached thread. Runs on the render thread after the draw submission.
pub(crate) fn deliver_still(
    gpu: &GpuContext,
    texture: &wgpu::Texture,
    width: u32,
    height: u32,
    callback: CaptureCallback,
) {
    let Some(pixels) = read_texture_flipped(gpu, texture, width, height) else {
        log::error!("Capture readback failed, dropping request");
        return;
    };

    let Some(image) = image::RgbaImage::from_raw(width, height, pixels) else {
        log::error!("Capture produced a malformed pixel buffer");
        return;
    };

    // The callback runs off the render thread; the save collaborator owns
    // everything from here.
    let spawned = std::thread::Builder::new()
        .name("capture-delivery".to_string())
        .spawn(move || callback(image));
    if let Err(e) = spawned {
        log::error!("Failed to spawn capture delivery thread: {}", e);
    }
}

/// Copy a texture into a staging buffer and return its pixels with rows in
/// image order (flipped from GPU framebuffer order), padding stripped.
fn read_texture_flipped(
    gpu: &GpuContext,
    texture: &wgpu::Texture,
    width: u32,
    height: u32,
) -> Option<Vec<u8>> {
    let unpadded_bytes_per_row = width * 4;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    let padded_bytes_per_row = unpadded_bytes_per_row.div_ceil(align) * align;

    let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Capture Staging Buffer"),
        size: (padded_bytes_per_row * height) as u64,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });

    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Capture Encoder"),
        });

    encoder.copy_texture_to_buffer(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyBufferInfo {
            buffer: &staging,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded_bytes_per_row),
                rows_per_image: Some(height),
            },
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );

    gpu.queue.submit(std::iter::once(encoder.finish()));

    let slice = staging.slice(..);
    let (sender, receiver) = crossbeam_channel::bounded(1);
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    gpu.device.poll(wgpu::Maintain::Wait);

    match receiver.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            log::error!("Failed to map capture buffer: {:?}", e);
            return None;
        }
        Err(_) => {
            log::error!("Capture map callback never fired");
            return None;
        }
    }

    let data = slice.get_mapped_range();
    let pixels = unpack_rows_flipped(
        &data,
        padded_bytes_per_row as usize,
        unpadded_bytes_per_row as usize,
        height,
    );
    drop(data);
    staging.unmap();

    Some(pixels)
}

/// Strip row padding and reverse row order in one pass. The GPU framebuffer
/// origin is bottom-left while image rows start at the top.
pub(crate) fn unpack_rows_flipped(
    data: &[u8],
    padded_bytes_per_row: usize,
    unpadded_bytes_per_row: usize,
    height: u32,
) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(unpadded_bytes_per_row * height as usize);
    for row in (0..height as usize).rev() {
        let start = row * padded_bytes_per_row;
        pixels.extend_from_slice(&data[start..start + unpadded_bytes_per_row]);
    }
    pixels
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn newest_request_wins() {
        let slot = CaptureSlot::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        {
            let first = first.clone();
            slot.request(move |_| {
                first.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let second = second.clone();
            slot.request(move |_| {
                second.fetch_add(1, Ordering::SeqCst);
            });
        }

        let callback = slot.take().unwrap();
        callback(image::RgbaImage::new(1, 1));

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn take_clears_the_pending_flag() {
        let slot = CaptureSlot::new();
        assert!(!slot.is_pending());

        slot.request(|_| {});
        assert!(slot.is_pending());

        assert!(slot.take().is_some());
        assert!(!slot.is_pending());
        assert!(slot.take().is_none());
    }

    #[test]
    fn unpack_flips_and_strips_padding() {
        // 2x3 image, 2 pixels per row (8 bytes), padded to 12 bytes per row
        let mut data = Vec::new();
        for row in 0u8..3 {
            let mut bytes = vec![row; 8];
            bytes.extend_from_slice(&[0xAA; 4]); // padding
            data.extend_from_slice(&bytes);
        }

        let pixels = unpack_rows_flipped(&data, 12, 8, 3);

        assert_eq!(pixels.len(), 24);
        assert!(pixels[0..8].iter().all(|&b| b == 2));
        assert!(pixels[8..16].iter().all(|&b| b == 1));
        assert!(pixels[16..24].iter().all(|&b| b == 0));
    }

    #[test]
    fn unpack_handles_unpadded_rows() {
        let data = vec![7u8; 16];
        let pixels = unpack_rows_flipped(&data, 8, 8, 2);
        assert_eq!(pixels, vec![7u8; 16]);
    }
}
