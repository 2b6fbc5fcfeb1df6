#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::RgbImage;
use smartsession::error::SessionError;
use smartsession::source::{SyntheticCamera, VideoDevice, VideoSource};
use tokio::sync::watch;
use tokio::time::timeout;

/// Synthetic camera that counts how often its sources are released.
pub struct CountingCamera {
    inner: SyntheticCamera,
    pub released: Arc<AtomicUsize>,
}

impl CountingCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            inner: SyntheticCamera::new(width, height),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn releases(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

struct Counted {
    source: Box<dyn VideoSource>,
    released: Arc<AtomicUsize>,
}

impl VideoSource for Counted {
    fn capture(&mut self) -> Result<RgbImage, SessionError> {
        self.source.capture()
    }

    fn release(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.source.release();
    }
}

impl VideoDevice for CountingCamera {
    fn acquire(&self) -> Result<Box<dyn VideoSource>, SessionError> {
        let source = self.inner.acquire()?;
        Ok(Box::new(Counted {
            source,
            released: self.released.clone(),
        }))
    }
}

pub async fn wait_for<T>(rx: &mut watch::Receiver<T>, f: impl FnMut(&T) -> bool) {
    timeout(Duration::from_secs(5), rx.wait_for(f))
        .await
        .expect("timed out waiting for watch condition")
        .expect("watch sender dropped");
}
