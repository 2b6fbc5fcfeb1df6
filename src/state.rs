use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::analyzer::FrameAnalyzer;
use crate::config::Config;
use crate::dashboard::DashboardView;
use crate::models::{ServerMessage, StudentState};

pub type WsTx = mpsc::UnboundedSender<Message>;

/// Queue one server message on a socket. Returns false if the socket's queue
/// has closed or the message could not be serialized.
pub fn send_message(tx: &WsTx, msg: &ServerMessage) -> bool {
    match msg.to_json() {
        Some(text) => tx.send(Message::Text(text)).is_ok(),
        None => false,
    }
}

/// One registered socket. `conn_id` tells a reconnect apart from the socket it replaced.
pub struct Peer {
    pub conn_id: u64,
    pub tx: WsTx,
}

pub struct RelayState {
    pub config: Config,
    pub analyzer: Arc<dyn FrameAnalyzer>,
    pub start_time: DateTime<Utc>,
    /// Connected students (student id -> socket)
    pub students: DashMap<String, Peer>,
    /// Connected teacher dashboards (teacher id -> socket)
    pub teachers: DashMap<String, Peer>,
    /// Latest analysed state per connected student
    pub latest: DashMap<String, StudentState>,
    next_conn: AtomicU64,
}

impl RelayState {
    pub fn new(config: Config, analyzer: Arc<dyn FrameAnalyzer>) -> Self {
        Self {
            config,
            analyzer,
            start_time: Utc::now(),
            students: DashMap::new(),
            teachers: DashMap::new(),
            latest: DashMap::new(),
            next_conn: AtomicU64::new(1),
        }
    }

    fn next_conn_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register_student(&self, student_id: &str, tx: WsTx) -> u64 {
        let conn_id = self.next_conn_id();
        if self
            .students
            .insert(student_id.to_string(), Peer { conn_id, tx })
            .is_some()
        {
            tracing::warn!("Student {student_id} reconnected, replacing previous socket");
        }
        conn_id
    }

    /// Returns whether this socket was still the registered one.
    pub fn unregister_student(&self, student_id: &str, conn_id: u64) -> bool {
        let removed = self
            .students
            .remove_if(student_id, |_, peer| peer.conn_id == conn_id)
            .is_some();
        if removed {
            self.latest.remove(student_id);
        }
        removed
    }

    pub fn register_teacher(&self, teacher_id: &str, tx: WsTx) -> u64 {
        let conn_id = self.next_conn_id();
        self.teachers
            .insert(teacher_id.to_string(), Peer { conn_id, tx });
        conn_id
    }

    pub fn unregister_teacher(&self, teacher_id: &str, conn_id: u64) -> bool {
        self.teachers
            .remove_if(teacher_id, |_, peer| peer.conn_id == conn_id)
            .is_some()
    }

    pub fn snapshot(&self) -> DashboardView {
        self.latest.iter().map(|e| e.value().clone()).collect()
    }

    /// Send to every teacher; teachers whose queue has closed are dropped.
    pub fn broadcast_to_teachers(&self, msg: &ServerMessage) {
        let Some(text) = msg.to_json() else {
            return;
        };
        let dead: Vec<(String, u64)> = self
            .teachers
            .iter()
            .filter(|e| e.value().tx.send(Message::Text(text.clone())).is_err())
            .map(|e| (e.key().clone(), e.value().conn_id))
            .collect();

        for (teacher_id, conn_id) in dead {
            tracing::warn!("Dropping unreachable teacher {teacher_id}");
            self.unregister_teacher(&teacher_id, conn_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::BaselineAnalyzer;
    use crate::models::AnalysisResult;

    fn state() -> RelayState {
        RelayState::new(Config::default(), Arc::new(BaselineAnalyzer))
    }

    #[test]
    fn stale_socket_cleanup_keeps_the_reconnect() {
        let s = state();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let old = s.register_student("s1", tx1);
        let new = s.register_student("s1", tx2);
        s.latest.insert("s1".into(), StudentState::from_analysis(AnalysisResult {
            student_id: "s1".into(),
            ..AnalysisResult::default()
        }));

        assert!(!s.unregister_student("s1", old));
        assert!(s.students.contains_key("s1"));
        assert!(s.latest.contains_key("s1"));

        assert!(s.unregister_student("s1", new));
        assert!(s.students.is_empty());
        assert!(s.latest.is_empty());
    }

    #[test]
    fn broadcast_prunes_closed_teachers() {
        let s = state();
        let (live_tx, mut live_rx) = mpsc::unbounded_channel();
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        s.register_teacher("live", live_tx);
        s.register_teacher("dead", dead_tx);
        drop(dead_rx);

        s.broadcast_to_teachers(&ServerMessage::Pong);
        assert!(matches!(live_rx.try_recv(), Ok(Message::Text(_))));
        assert!(s.teachers.contains_key("live"));
        assert!(!s.teachers.contains_key("dead"));
    }

    #[test]
    fn send_message_reports_closed_sockets() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(send_message(&tx, &ServerMessage::Pong));
        match rx.try_recv() {
            Ok(Message::Text(text)) => assert_eq!(text, r#"{"type":"pong"}"#),
            other => panic!("expected pong text, got {other:?}"),
        }

        drop(rx);
        assert!(!send_message(&tx, &ServerMessage::Pong));
    }

    #[test]
    fn snapshot_lists_latest_states() {
        let s = state();
        for id in ["a", "b"] {
            s.latest.insert(id.into(), StudentState::from_analysis(AnalysisResult {
                student_id: id.into(),
                ..AnalysisResult::default()
            }));
        }
        let view = s.snapshot();
        assert_eq!(view.len(), 2);
        assert!(view.contains("a") && view.contains("b"));
    }
}
