//! Startup configuration
//!
//! Reads an optional `dotmatrix.json` from the working directory. A missing
//! file falls back to defaults; a malformed file is logged and ignored so
//! startup never fails on configuration.

use serde::Deserialize;

/// Configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "dotmatrix.json";

/// Application startup configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Camera index to open (0 for default).
    pub camera_index: u32,
    /// Requested capture width.
    pub capture_width: u32,
    /// Requested capture height.
    pub capture_height: u32,
    /// Mirror the camera feed horizontally.
    pub mirror: bool,
    /// Initial dot density (dots per axis unit).
    pub density: f32,
    /// Initial dot size factor.
    pub dot_size: f32,
    /// Initial depth distortion factor.
    pub distortion: f32,
    /// Initial foreground (dot) color, RGBA.
    pub foreground: [f32; 4],
    /// Initial background color, RGBA.
    pub background: [f32; 4],
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            camera_index: 0,
            capture_width: 1280,
            capture_height: 720,
            mirror: false,
            density: 50.0,
            dot_size: 1.0,
            distortion: 0.5,
            foreground: [0.0, 0.0, 0.0, 1.0],
            background: [1.0, 1.0, 1.0, 1.0],
        }
    }
}

impl AppConfig {
    /// Load configuration from [`CONFIG_FILE`], falling back to defaults.
    pub fn load() -> Self {
        match std::fs::read_to_string(CONFIG_FILE) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(config) => {
                    log::info!("Loaded configuration from {}", CONFIG_FILE);
                    config
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", CONFIG_FILE, e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.capture_width, 1280);
        assert_eq!(config.capture_height, 720);
        assert_eq!(config.density, 50.0);
        assert_eq!(config.background, [1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: AppConfig = serde_json::from_str(r#"{"density": 80.0, "mirror": true}"#).unwrap();
        assert_eq!(config.density, 80.0);
        assert!(config.mirror);
        assert_eq!(config.capture_width, 1280);
        assert_eq!(config.dot_size, 1.0);
    }
}
