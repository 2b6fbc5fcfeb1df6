//! Full capture → relay → dashboard cycle over the in-memory transport, with
//! the test standing in for the relay.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use smartsession::transport::{MemoryTransport, Transport};
use smartsession::{Config, ConnectionState, DashboardAggregator, StudentSession};

use common::{wait_for, CountingCamera};

fn config() -> Config {
    Config {
        backend_url: "mem://relay".into(),
        frame_interval_ms: 200,
        frame_width: 32,
        frame_height: 24,
        ..Config::default()
    }
}

#[tokio::test(start_paused = true)]
async fn three_ticks_three_frames_then_removal_from_dashboard() {
    let (transport, mut peers) = MemoryTransport::new();
    let transport: Arc<dyn Transport> = Arc::new(transport);
    let cfg = config();

    let dashboard = DashboardAggregator::new("t1", &cfg, transport.clone());
    dashboard.connect().unwrap();
    let teacher = peers.recv().await.unwrap();
    teacher.send_json(&json!({ "type": "initial_state", "data": {} }));

    let camera = Arc::new(CountingCamera::new(32, 24));
    let student = StudentSession::new("s1", &cfg, camera.clone(), transport.clone());
    student.start_session().unwrap();
    let mut student_peer = peers.recv().await.unwrap();
    assert_eq!(student_peer.endpoint, "mem://relay/ws/student/s1");
    wait_for(&mut student.subscribe_state(), |s| *s == ConnectionState::Streaming).await;

    tokio::time::sleep(Duration::from_millis(650)).await;

    let mut frames = 0;
    while let Some(text) = student_peer.try_recv() {
        let msg: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(msg["type"], "video_frame");
        frames += 1;

        let analysis = json!({
            "student_id": "s1",
            "timestamp": "2025-01-15T10:30:00Z",
            "status": "good",
            "emotion": "focused",
            "confidence": 0.85
        });
        student_peer.send_json(&json!({ "type": "analysis_result", "data": analysis }));
        teacher.send_json(&json!({ "type": "student_update", "data": analysis }));
    }
    assert_eq!(frames, 3);

    wait_for(&mut dashboard.subscribe(), |v| v.contains("s1")).await;
    wait_for(&mut student.subscribe_analysis(), |a| a.is_some()).await;
    assert_eq!(student.current_analysis().unwrap().emotion, "focused");

    student.stop_session().await;
    assert_eq!(student.state(), ConnectionState::Disconnected);
    assert_eq!(camera.releases(), 1);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(student_peer.recv().await, None);

    teacher.send_json(&json!({ "type": "student_disconnected", "data": { "student_id": "s1" } }));
    wait_for(&mut dashboard.subscribe(), |v| !v.contains("s1")).await;
    assert_eq!(dashboard.student_count(), 0);

    // stop again, as an unmount would
    student.stop_session().await;
    assert_eq!(camera.releases(), 1);
}
