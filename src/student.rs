//! Capture-role client: camera → sampler → `video_frame` messages, with the
//! latest `analysis_result` kept in a single slot.
//!
//! States run `Disconnected → Connecting → Connected → Streaming`, with
//! `Error` reachable from the three active states. Nothing retries; after an
//! error or remote close the caller starts a new session explicitly.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::Config;
use crate::connection::{ConnectionManager, MessageHandler};
use crate::error::SessionError;
use crate::models::{
    AnalysisResult, ClientMessage, ConnectionState, Role, Session, StudentEvent,
};
use crate::sampler::{FrameSampler, SamplerConfig};
use crate::source::{VideoDevice, VideoSource};
use crate::transport::Transport;

/// What one run of the session owns. Each `start_session` gets a fresh one,
/// so a previous run's driver can only tear down its own camera and sampler.
struct Run {
    source: Option<Box<dyn VideoSource>>,
    sampler: Option<FrameSampler>,
}

type RunSlot = Arc<Mutex<Run>>;

struct StudentInner {
    student_id: String,
    endpoint: String,
    sampler_config: SamplerConfig,
    device: Arc<dyn VideoDevice>,
    transport: Arc<dyn Transport>,
    conn: ConnectionManager,
    analysis: watch::Sender<Option<AnalysisResult>>,
    current: Mutex<Option<RunSlot>>,
}

pub struct StudentSession {
    inner: Arc<StudentInner>,
}

impl StudentSession {
    pub fn new(
        student_id: impl Into<String>,
        config: &Config,
        device: Arc<dyn VideoDevice>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let student_id = student_id.into();
        let (analysis, _) = watch::channel(None);
        Self {
            inner: Arc::new(StudentInner {
                endpoint: config.endpoint(Role::Student, &student_id),
                conn: ConnectionManager::new(
                    format!("student {student_id}"),
                    config.overflow,
                    config.outbound_buffer,
                ),
                sampler_config: SamplerConfig::from_config(config),
                student_id,
                device,
                transport,
                analysis,
                current: Mutex::new(None),
            }),
        }
    }

    pub fn student_id(&self) -> &str {
        &self.inner.student_id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.conn.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.conn.subscribe()
    }

    pub fn session(&self) -> Session {
        Session {
            id: self.inner.student_id.clone(),
            role: Role::Student,
            connection_state: self.state(),
        }
    }

    /// Last analysis received, if any.
    pub fn current_analysis(&self) -> Option<AnalysisResult> {
        self.inner.analysis.borrow().clone()
    }

    pub fn subscribe_analysis(&self) -> watch::Receiver<Option<AnalysisResult>> {
        self.inner.analysis.subscribe()
    }

    /// Acquire the camera and open the channel. Streaming begins once the
    /// channel reports connected.
    pub fn start_session(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        if inner.conn.state().is_active() {
            return Err(SessionError::AlreadyActive);
        }

        let source = match inner.device.acquire() {
            Ok(source) => source,
            Err(e) => {
                tracing::error!("student {}: camera unavailable: {e}", inner.student_id);
                inner.conn.transition(ConnectionState::Error);
                return Err(e);
            }
        };

        inner.analysis.send_replace(None);
        let run: RunSlot = Arc::new(Mutex::new(Run {
            source: Some(source),
            sampler: None,
        }));

        let handler = StudentHandler {
            inner: Arc::clone(inner),
            run: run.clone(),
        };
        let previous = inner.current.lock().replace(run.clone());
        if let Err(e) = inner.conn.connect(inner.transport.clone(), &inner.endpoint, handler) {
            // a run that is already active keeps its slot
            *inner.current.lock() = previous;
            if let Some(mut source) = run.lock().source.take() {
                source.release();
            }
            return Err(e);
        }
        Ok(())
    }

    /// Stop sampling, release the camera, close the channel. Safe before any
    /// start and safe to repeat.
    pub async fn stop_session(&self) {
        self.inner.conn.close();
        let run = self.inner.current.lock().take();
        if let Some(run) = run {
            teardown(&run).await;
        }
    }
}

/// Dropping without `stop_session` closes the channel; the driver then
/// releases the camera on its way out.
impl Drop for StudentSession {
    fn drop(&mut self) {
        self.inner.conn.close();
    }
}

impl StudentInner {
    fn begin_streaming(&self, run: &RunSlot, conn: &ConnectionManager) {
        let mut resources = run.lock();
        let Some(source) = resources.source.take() else {
            tracing::debug!("student {}: connected after teardown, not streaming", self.student_id);
            return;
        };

        let outbound = conn.clone();
        let sampler = FrameSampler::start(source, self.sampler_config.clone(), move |frame| {
            outbound.send_json(&ClientMessage::VideoFrame {
                frame: frame.to_data_url(),
            });
        });
        resources.sampler = Some(sampler);
        conn.mark_streaming();
        tracing::info!(
            "student {}: streaming every {:?}",
            self.student_id,
            self.sampler_config.interval
        );
    }

    /// Forget `run` if it is still the current one.
    fn retire(&self, run: &RunSlot) {
        let mut current = self.current.lock();
        if current.as_ref().map_or(false, |c| Arc::ptr_eq(c, run)) {
            current.take();
        }
    }
}

/// Every exit path of a run ends here; `take()` under the lock makes the
/// release happen once.
async fn teardown(run: &Mutex<Run>) {
    let (sampler, source) = {
        let mut resources = run.lock();
        (resources.sampler.take(), resources.source.take())
    };
    if let Some(mut sampler) = sampler {
        sampler.stop().await;
    }
    if let Some(mut source) = source {
        source.release();
    }
}

struct StudentHandler {
    inner: Arc<StudentInner>,
    run: RunSlot,
}

#[async_trait]
impl MessageHandler for StudentHandler {
    fn on_connected(&mut self, conn: &ConnectionManager) {
        self.inner.begin_streaming(&self.run, conn);
    }

    fn on_message(&mut self, kind: &str, data: Value) -> Result<(), SessionError> {
        match StudentEvent::from_wire(kind, data)? {
            Some(StudentEvent::AnalysisResult(analysis)) => {
                if !analysis.scores_in_range() {
                    tracing::warn!(
                        "student {}: analysis scores out of [0,1] (confidence {}, confusion {})",
                        self.inner.student_id,
                        analysis.confidence,
                        analysis.confusion_score
                    );
                }
                self.inner.analysis.send_replace(Some(analysis));
            }
            None => tracing::debug!("student {}: ignoring '{kind}'", self.inner.student_id),
        }
        Ok(())
    }

    async fn on_terminated(&mut self, state: ConnectionState) {
        tracing::info!("student {}: session ended ({state})", self.inner.student_id);
        self.inner.retire(&self.run);
        teardown(&self.run).await;
    }
}
