//! Render parameters
//!
//! Parameters are written from whichever thread drives the controls and read
//! once per frame by the render loop. Each scalar is its own native-width
//! atomic; there is deliberately no cross-field synchronization. A write that
//! lands mid-frame can tear *between* fields, which is visually harmless for
//! a continuous effect and self-corrects on the next frame. Do not replace
//! this with a lock shared with the render loop.

use std::sync::atomic::{AtomicU32, Ordering};

/// Density used when the supplied value is degenerate (< 1.0).
pub const DEFAULT_DENSITY: f32 = 50.0;

/// Atomic parameter block shared between the control side and the render
/// loop.
pub struct RenderParams {
    density: AtomicU32,
    dot_size: AtomicU32,
    distortion: AtomicU32,
    foreground: [AtomicU32; 4],
    background: [AtomicU32; 4],
}

/// Per-frame copy of all parameters, read field by field.
pub(crate) struct ParamSnapshot {
    pub density: f32,
    pub dot_size: f32,
    pub distortion: f32,
    pub foreground: [f32; 4],
    pub background: [f32; 4],
}

fn atomic_rgba(rgba: [f32; 4]) -> [AtomicU32; 4] {
    [
        AtomicU32::new(rgba[0].to_bits()),
        AtomicU32::new(rgba[1].to_bits()),
        AtomicU32::new(rgba[2].to_bits()),
        AtomicU32::new(rgba[3].to_bits()),
    ]
}

fn store_rgba(target: &[AtomicU32; 4], rgba: [f32; 4]) {
    for (slot, component) in target.iter().zip(rgba) {
        slot.store(component.to_bits(), Ordering::Relaxed);
    }
}

fn load_rgba(source: &[AtomicU32; 4]) -> [f32; 4] {
    [
        f32::from_bits(source[0].load(Ordering::Relaxed)),
        f32::from_bits(source[1].load(Ordering::Relaxed)),
        f32::from_bits(source[2].load(Ordering::Relaxed)),
        f32::from_bits(source[3].load(Ordering::Relaxed)),
    ]
}

impl RenderParams {
    pub fn new(
        density: f32,
        dot_size: f32,
        distortion: f32,
        foreground: [f32; 4],
        background: [f32; 4],
    ) -> Self {
        Self {
            density: AtomicU32::new(density.to_bits()),
            dot_size: AtomicU32::new(dot_size.to_bits()),
            distortion: AtomicU32::new(distortion.to_bits()),
            foreground: atomic_rgba(foreground),
            background: atomic_rgba(background),
        }
    }

    pub fn density(&self) -> f32 {
        f32::from_bits(self.density.load(Ordering::Relaxed))
    }

    pub fn set_density(&self, value: f32) {
        self.density.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn dot_size(&self) -> f32 {
        f32::from_bits(self.dot_size.load(Ordering::Relaxed))
    }

    pub fn set_dot_size(&self, value: f32) {
        self.dot_size.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn distortion(&self) -> f32 {
        f32::from_bits(self.distortion.load(Ordering::Relaxed))
    }

    pub fn set_distortion(&self, value: f32) {
        self.distortion.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn foreground(&self) -> [f32; 4] {
        load_rgba(&self.foreground)
    }

    pub fn set_foreground(&self, rgba: [f32; 4]) {
        store_rgba(&self.foreground, rgba);
    }

    pub fn background(&self) -> [f32; 4] {
        load_rgba(&self.background)
    }

    pub fn set_background(&self, rgba: [f32; 4]) {
        store_rgba(&self.background, rgba);
    }

    pub(crate) fn snapshot(&self) -> ParamSnapshot {
        ParamSnapshot {
            density: self.density(),
            dot_size: self.dot_size(),
            distortion: self.distortion(),
            foreground: self.foreground(),
            background: self.background(),
        }
    }
}

impl Default for RenderParams {
    fn default() -> Self {
        Self::new(
            DEFAULT_DENSITY,
            1.0,
            0.5,
            [0.0, 0.0, 0.0, 1.0],
            [1.0, 1.0, 1.0, 1.0],
        )
    }
}

/// Replace a degenerate density with the default. The shader divides by
/// density, so values below 1.0 are treated as misconfiguration.
pub(crate) fn resolve_density(density: f32) -> f32 {
    if density < 1.0 {
        DEFAULT_DENSITY
    } else {
        density
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn degenerate_density_falls_back_to_default() {
        assert_eq!(resolve_density(0.0), 50.0);
        assert_eq!(resolve_density(0.99), 50.0);
        assert_eq!(resolve_density(-10.0), 50.0);
        assert_eq!(resolve_density(1.0), 1.0);
        assert_eq!(resolve_density(120.0), 120.0);
    }

    #[test]
    fn fields_round_trip() {
        let params = RenderParams::default();
        params.set_density(80.0);
        params.set_dot_size(1.5);
        params.set_distortion(0.25);
        params.set_foreground([0.9, 0.2, 0.2, 1.0]);
        params.set_background([0.0, 0.0, 0.0, 1.0]);

        let snapshot = params.snapshot();
        assert_eq!(snapshot.density, 80.0);
        assert_eq!(snapshot.dot_size, 1.5);
        assert_eq!(snapshot.distortion, 0.25);
        assert_eq!(snapshot.foreground, [0.9, 0.2, 0.2, 1.0]);
        assert_eq!(snapshot.background, [0.0, 0.0, 0.0, 1.0]);
    }

    /// Each field is individually atomic; a concurrent writer can never make
    /// a reader observe a torn *value*, only a mix of old and new *fields*.
    /// The mixed-field case is accepted behavior, so this only pins down
    /// per-field integrity.
    #[test]
    fn concurrent_writes_keep_fields_intact() {
        let params = Arc::new(RenderParams::default());
        let writer = {
            let params = params.clone();
            std::thread::spawn(move || {
                for i in 0..1000 {
                    let value = 10.0 + (i % 140) as f32;
                    params.set_density(value);
                    params.set_dot_size(0.5 + (i % 15) as f32 * 0.1);
                }
            })
        };

        for _ in 0..1000 {
            let snapshot = params.snapshot();
            assert!((10.0..=150.0).contains(&snapshot.density));
            assert!((0.5..=2.0).contains(&snapshot.dot_size));
        }

        writer.join().unwrap();
    }
}
