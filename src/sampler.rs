use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::SessionError;
use crate::models::Frame;
use crate::source::VideoSource;

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub interval: Duration,
    pub jpeg_quality: u8,
}

impl SamplerConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            interval: cfg.frame_interval(),
            jpeg_quality: cfg.jpeg_quality.clamp(1, 100),
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Fixed-rate frame capture.
///
/// Ticks fire on schedule whether or not the previous frame has been sent;
/// there is no backpressure. Whatever `on_frame` does with a frame (queue or
/// drop) is the caller's policy. Capture and encode failures skip one tick.
///
/// The sampler owns the [`VideoSource`] from `start` until the sampling task
/// exits, and releases it on the way out.
pub struct FrameSampler {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl FrameSampler {
    pub fn start<F>(source: Box<dyn VideoSource>, config: SamplerConfig, on_frame: F) -> Self
    where
        F: FnMut(Frame) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sample_loop(source, config, on_frame, cancel.clone()));
        Self {
            cancel: Some(cancel),
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Cancel the timer and wait for the source to be released. Safe to call
    /// more than once. An encode already underway finishes first.
    pub async fn stop(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!("frame sampler task failed: {e}");
            }
        }
    }
}

impl Drop for FrameSampler {
    fn drop(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }
}

async fn sample_loop<F>(
    mut source: Box<dyn VideoSource>,
    config: SamplerConfig,
    mut on_frame: F,
    cancel: CancellationToken,
) where
    F: FnMut(Frame) + Send + 'static,
{
    let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
    tracing::debug!("frame sampler started ({:?} period)", config.interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match capture_frame(source.as_mut(), config.jpeg_quality) {
                    Ok(frame) => on_frame(frame),
                    Err(e) => tracing::debug!("skipping frame: {e}"),
                }
            }
        }
    }

    source.release();
    tracing::debug!("frame sampler stopped");
}

fn capture_frame(source: &mut dyn VideoSource, quality: u8) -> Result<Frame, SessionError> {
    let image = source.capture()?;
    if image.width() == 0 || image.height() == 0 {
        return Err(SessionError::Device("source not ready (zero dimensions)".into()));
    }
    Ok(Frame::jpeg(encode_jpeg(&image, quality)?))
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, SessionError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(image)
        .map_err(|e| SessionError::Encode(e.to_string()))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Fails every `fail_every`-th capture, counts releases.
    struct FlakySource {
        captures: usize,
        fail_every: usize,
        released: Arc<AtomicUsize>,
    }

    impl VideoSource for FlakySource {
        fn capture(&mut self) -> Result<RgbImage, SessionError> {
            self.captures += 1;
            if self.fail_every > 0 && self.captures % self.fail_every == 0 {
                return Ok(RgbImage::new(0, 0));
            }
            Ok(RgbImage::from_pixel(8, 8, Rgb([10, 20, 30])))
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> SamplerConfig {
        SamplerConfig {
            interval: Duration::from_millis(200),
            jpeg_quality: 80,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_per_interval_and_releases_on_stop() {
        let released = Arc::new(AtomicUsize::new(0));
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        let source = FlakySource {
            captures: 0,
            fail_every: 0,
            released: released.clone(),
        };

        let mut sampler = FrameSampler::start(Box::new(source), config(), move |f| sink.lock().push(f));
        tokio::time::sleep(Duration::from_millis(650)).await;
        assert_eq!(frames.lock().len(), 3);
        assert!(frames.lock().iter().all(|f| f.encoding == "image/jpeg" && f.payload.starts_with(&[0xff, 0xd8])));

        sampler.stop().await;
        sampler.stop().await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(!sampler.is_running());

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(frames.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_captures_skip_a_tick_and_sampling_continues() {
        let released = Arc::new(AtomicUsize::new(0));
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let source = FlakySource {
            captures: 0,
            fail_every: 2,
            released: released.clone(),
        };

        let mut sampler = FrameSampler::start(Box::new(source), config(), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(1050)).await;
        sampler.stop().await;

        // five ticks, every second capture is empty
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn encode_produces_jpeg() {
        let img = RgbImage::from_pixel(16, 16, Rgb([200, 100, 50]));
        let bytes = encode_jpeg(&img, 80).unwrap();
        assert_eq!(&bytes[..2], &[0xff, 0xd8]);
    }
}
