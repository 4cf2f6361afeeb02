//! Capture/encode devices.
//!
//! A capture device plays two roles at once:
//! - it delivers low-resolution analysis frames through a non-blocking poll
//! - it writes the full-resolution encoded stream to a file on its own
//!
//! The controller only starts and stops encoding; it never touches encoded
//! bytes. Backends:
//! - Synthetic source for `stub://` devices (testing, bench runs)
//! - V4L2 device frames plus an external encoder command
//!   (feature: capture-v4l2)

pub mod encoder;
pub mod synthetic;
#[cfg(feature = "capture-v4l2")]
pub mod v4l2;

use anyhow::Result;
use std::path::Path;
use std::time::Duration;

use crate::frame::Frame;

pub use encoder::CommandEncoder;
pub use synthetic::{SyntheticCamera, SyntheticConfig};
#[cfg(feature = "capture-v4l2")]
pub use v4l2::V4l2Camera;

/// Interface the segment controller consumes.
pub trait CaptureDevice: Send {
    /// Begin writing the encoded stream to `path`. Fails if already encoding.
    fn start_encoding(&mut self, path: &Path) -> Result<()>;

    /// Stop writing and flush. When this returns the file is complete.
    fn stop_encoding(&mut self) -> Result<()>;

    fn is_encoding(&self) -> bool;

    /// Next analysis frame if one is ready. `Ok(None)` is a transient miss,
    /// not an error; `Err` means the device itself failed.
    fn poll_low_res_frame(&mut self) -> Result<Option<Frame>>;

    /// Analysis frames the device captured but never delivered.
    fn dropped_frames(&self) -> u64 {
        0
    }
}

/// Device settings handed over by the configuration layer.
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// `stub://name` for the synthetic source, otherwise a device node.
    pub device: String,
    /// Analysis frame width.
    pub width: u32,
    /// Analysis frame height.
    pub height: u32,
    /// Analysis frame rate.
    pub framerate: u32,
    /// Encoder argv; `{path}` is replaced with the segment file.
    pub encoder_command: Option<Vec<String>>,
    /// How long a stopping encoder may take to flush before it is killed.
    pub encoder_stop_grace: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "stub://feeder".to_string(),
            width: 320,
            height: 240,
            framerate: 10,
            encoder_command: None,
            encoder_stop_grace: encoder::DEFAULT_STOP_GRACE,
        }
    }
}

/// Capture device selected from configuration.
pub struct Camera {
    backend: CameraBackend,
}

enum CameraBackend {
    Synthetic(SyntheticCamera),
    #[cfg(feature = "capture-v4l2")]
    V4l2(V4l2Camera),
}

impl Camera {
    pub fn open(config: CaptureConfig) -> Result<Self> {
        if config.device.starts_with("stub://") {
            let synthetic = SyntheticConfig {
                name: config.device.clone(),
                width: config.width,
                height: config.height,
                framerate: config.framerate,
                ..SyntheticConfig::default()
            };
            return Ok(Self {
                backend: CameraBackend::Synthetic(SyntheticCamera::new(synthetic)?),
            });
        }
        #[cfg(feature = "capture-v4l2")]
        {
            Ok(Self {
                backend: CameraBackend::V4l2(V4l2Camera::open(config)?),
            })
        }
        #[cfg(not(feature = "capture-v4l2"))]
        {
            anyhow::bail!(
                "device {} requires the capture-v4l2 feature",
                config.device
            )
        }
    }

    fn device(&mut self) -> &mut dyn CaptureDevice {
        match &mut self.backend {
            CameraBackend::Synthetic(camera) => camera,
            #[cfg(feature = "capture-v4l2")]
            CameraBackend::V4l2(camera) => camera,
        }
    }
}

impl CaptureDevice for Camera {
    fn start_encoding(&mut self, path: &Path) -> Result<()> {
        self.device().start_encoding(path)
    }

    fn stop_encoding(&mut self) -> Result<()> {
        self.device().stop_encoding()
    }

    fn is_encoding(&self) -> bool {
        match &self.backend {
            CameraBackend::Synthetic(camera) => camera.is_encoding(),
            #[cfg(feature = "capture-v4l2")]
            CameraBackend::V4l2(camera) => camera.is_encoding(),
        }
    }

    fn poll_low_res_frame(&mut self) -> Result<Option<Frame>> {
        self.device().poll_low_res_frame()
    }

    fn dropped_frames(&self) -> u64 {
        match &self.backend {
            CameraBackend::Synthetic(camera) => camera.dropped_frames(),
            #[cfg(feature = "capture-v4l2")]
            CameraBackend::V4l2(camera) => camera.dropped_frames(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_device_opens_synthetic_backend() -> Result<()> {
        let mut camera = Camera::open(CaptureConfig {
            width: 16,
            height: 12,
            ..CaptureConfig::default()
        })?;
        let frame = camera.poll_low_res_frame()?.expect("synthetic frame");
        assert_eq!((frame.width, frame.height), (16, 12));
        assert!(!camera.is_encoding());
        Ok(())
    }

    #[cfg(not(feature = "capture-v4l2"))]
    #[test]
    fn device_node_requires_feature() {
        let result = Camera::open(CaptureConfig {
            device: "/dev/video0".to_string(),
            ..CaptureConfig::default()
        });
        assert!(result.is_err());
    }
}
