use image::{Rgb, RgbImage};

use crate::error::SessionError;

/// A live capture handle. Owned by exactly one sampler for a session and
/// released exactly once.
pub trait VideoSource: Send + 'static {
    /// Current image. An error (or an empty image) skips this tick only.
    fn capture(&mut self) -> Result<RgbImage, SessionError>;

    /// Stop the underlying tracks.
    fn release(&mut self);
}

/// Something that can hand out a [`VideoSource`], e.g. a camera.
pub trait VideoDevice: Send + Sync {
    /// Fails with [`SessionError::Device`] when denied or absent.
    fn acquire(&self) -> Result<Box<dyn VideoSource>, SessionError>;
}

/// Test-pattern camera: a diagonal gradient that shifts every frame.
#[derive(Debug, Clone)]
pub struct SyntheticCamera {
    pub width: u32,
    pub height: u32,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl VideoDevice for SyntheticCamera {
    fn acquire(&self) -> Result<Box<dyn VideoSource>, SessionError> {
        if self.width == 0 || self.height == 0 {
            return Err(SessionError::Device(format!(
                "synthetic camera has no usable resolution ({}x{})",
                self.width, self.height
            )));
        }
        tracing::info!("Synthetic camera opened at {}x{}", self.width, self.height);
        Ok(Box::new(SyntheticSource {
            width: self.width,
            height: self.height,
            tick: 0,
            released: false,
        }))
    }
}

struct SyntheticSource {
    width: u32,
    height: u32,
    tick: u32,
    released: bool,
}

impl VideoSource for SyntheticSource {
    fn capture(&mut self) -> Result<RgbImage, SessionError> {
        if self.released {
            return Err(SessionError::Device("source released".into()));
        }
        self.tick = self.tick.wrapping_add(1);
        let shift = self.tick.wrapping_mul(7) % (self.width.max(self.height));
        let (w, h) = (self.width, self.height);
        Ok(RgbImage::from_fn(w, h, |x, y| {
            let r = ((x + shift) % w * 255 / w) as u8;
            let g = ((y + shift) % h * 255 / h) as u8;
            Rgb([r, g, 128])
        }))
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            tracing::info!("Synthetic camera released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_frames_have_configured_size_and_change() {
        let mut src = SyntheticCamera::new(32, 24).acquire().unwrap();
        let a = src.capture().unwrap();
        let b = src.capture().unwrap();
        assert_eq!(a.dimensions(), (32, 24));
        assert_ne!(a.as_raw(), b.as_raw());
        src.release();
        assert!(src.capture().is_err());
    }

    #[test]
    fn zero_resolution_is_a_device_error() {
        let err = SyntheticCamera::new(0, 480).acquire().err().unwrap();
        assert!(matches!(err, SessionError::Device(_)));
    }
}
