//! Observer-role client and the view it reconciles.
//!
//! [`DashboardView::apply`] is the only writer of the view. The aggregator
//! calls it from its connection handler and publishes the result through a
//! `watch` channel; everyone else reads clones.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::Config;
use crate::connection::{ConnectionManager, MessageHandler};
use crate::error::SessionError;
use crate::models::{AnalysisStatus, ConnectionState, DashboardEvent, Role, Session, StudentState};
use crate::transport::Transport;

/// `student_id` → latest state. Every entry comes from a server message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DashboardView {
    students: HashMap<String, StudentState>,
}

impl DashboardView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one server event into the view. Arrival order is event order;
    /// nothing is reordered or deduplicated by timestamp.
    pub fn apply(&mut self, event: DashboardEvent) {
        match event {
            DashboardEvent::InitialState(snapshot) => {
                *self = snapshot;
            }
            DashboardEvent::StudentUpdate(analysis) => {
                let state = StudentState::from_analysis(analysis);
                self.students.insert(state.student_id.clone(), state);
            }
            DashboardEvent::StudentDisconnected { student_id } => {
                self.students.remove(&student_id);
            }
        }
    }

    /// Fill entries whose payload omitted `student_id` from their map key.
    pub(crate) fn with_keyed_ids(mut self) -> Self {
        for (id, state) in self.students.iter_mut() {
            if state.student_id.is_empty() {
                state.student_id = id.clone();
            }
        }
        self
    }

    pub fn get(&self, student_id: &str) -> Option<&StudentState> {
        self.students.get(student_id)
    }

    pub fn contains(&self, student_id: &str) -> bool {
        self.students.contains_key(student_id)
    }

    pub fn len(&self) -> usize {
        self.students.len()
    }

    pub fn is_empty(&self) -> bool {
        self.students.is_empty()
    }

    pub fn alert_count(&self) -> usize {
        self.count_with_status(AnalysisStatus::Alert)
    }

    pub fn count_with_status(&self, status: AnalysisStatus) -> usize {
        self.students.values().filter(|s| s.status() == status).count()
    }

    /// Entries sorted by id, for stable rendering.
    pub fn students(&self) -> Vec<&StudentState> {
        let mut list: Vec<_> = self.students.values().collect();
        list.sort_by(|a, b| a.student_id.cmp(&b.student_id));
        list
    }

    pub(crate) fn upsert(&mut self, state: StudentState) {
        self.students.insert(state.student_id.clone(), state);
    }

    pub(crate) fn remove(&mut self, student_id: &str) -> Option<StudentState> {
        self.students.remove(student_id)
    }
}

impl FromIterator<StudentState> for DashboardView {
    fn from_iter<I: IntoIterator<Item = StudentState>>(iter: I) -> Self {
        let mut view = DashboardView::new();
        for state in iter {
            view.upsert(state);
        }
        view
    }
}

pub struct DashboardAggregator {
    teacher_id: String,
    endpoint: String,
    transport: Arc<dyn Transport>,
    conn: ConnectionManager,
    view: Arc<watch::Sender<DashboardView>>,
}

impl DashboardAggregator {
    pub fn new(teacher_id: impl Into<String>, config: &Config, transport: Arc<dyn Transport>) -> Self {
        let teacher_id = teacher_id.into();
        let (view, _) = watch::channel(DashboardView::new());
        Self {
            endpoint: config.endpoint(Role::Teacher, &teacher_id),
            conn: ConnectionManager::new(
                format!("teacher {teacher_id}"),
                config.overflow,
                config.outbound_buffer,
            ),
            teacher_id,
            transport,
            view: Arc::new(view),
        }
    }

    pub fn connect(&self) -> Result<(), SessionError> {
        let handler = DashboardHandler {
            teacher_id: self.teacher_id.clone(),
            view: self.view.clone(),
        };
        self.conn.connect(self.transport.clone(), &self.endpoint, handler)
    }

    /// Idempotent. The last view stays readable; the next `initial_state`
    /// replaces it.
    pub fn disconnect(&self) {
        self.conn.close();
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.conn.subscribe()
    }

    pub fn session(&self) -> Session {
        Session {
            id: self.teacher_id.clone(),
            role: Role::Teacher,
            connection_state: self.state(),
        }
    }

    /// Snapshot of the current view.
    pub fn view(&self) -> DashboardView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DashboardView> {
        self.view.subscribe()
    }

    pub fn student_count(&self) -> usize {
        self.view.borrow().len()
    }

    pub fn alert_count(&self) -> usize {
        self.view.borrow().alert_count()
    }
}

impl Drop for DashboardAggregator {
    fn drop(&mut self) {
        self.conn.close();
    }
}

struct DashboardHandler {
    teacher_id: String,
    view: Arc<watch::Sender<DashboardView>>,
}

#[async_trait]
impl MessageHandler for DashboardHandler {
    fn on_message(&mut self, kind: &str, data: Value) -> Result<(), SessionError> {
        let Some(event) = DashboardEvent::from_wire(kind, data)? else {
            tracing::debug!("teacher {}: ignoring '{kind}'", self.teacher_id);
            return Ok(());
        };
        if let DashboardEvent::StudentUpdate(analysis) = &event {
            if !analysis.scores_in_range() {
                tracing::warn!(
                    "teacher {}: student {} scores out of [0,1]",
                    self.teacher_id,
                    analysis.student_id
                );
            }
        }
        self.view.send_modify(|view| view.apply(event));
        Ok(())
    }

    async fn on_terminated(&mut self, state: ConnectionState) {
        tracing::info!("teacher {}: dashboard connection ended ({state})", self.teacher_id);
    }
}
