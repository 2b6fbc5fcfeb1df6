use std::sync::Arc;
use std::time::Duration;

use smartsession::analyzer::BaselineAnalyzer;
use smartsession::config::{self, Config};
use smartsession::models::ConnectionState;
use smartsession::routes;
use smartsession::source::SyntheticCamera;
use smartsession::state::RelayState;
use smartsession::transport::WsTransport;
use smartsession::{DashboardAggregator, StudentSession};

const USAGE: &str = "usage: smartsession [relay | student <id> | teacher <id>]";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .init();

    let cfg = config::load_config();
    let args: Vec<String> = std::env::args().skip(1).collect();

    match (args.first().map(String::as_str), args.get(1)) {
        (None | Some("relay"), _) => run_relay(cfg).await,
        (Some("student"), Some(id)) => run_student(cfg, id).await,
        (Some("teacher"), Some(id)) => run_teacher(cfg, id).await,
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}

async fn run_relay(cfg: Config) {
    tracing::info!("Config loaded: port {}, session path {}", cfg.port, cfg.session_path);

    let port = cfg.port;
    let listener = match routes::bind(port).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Cannot bind port {port}: {e}");
            return;
        }
    };
    let addr = listener.local_addr().map_or_else(|_| format!("0.0.0.0:{port}"), |a| a.to_string());
    let shared = Arc::new(RelayState::new(cfg, Arc::new(BaselineAnalyzer)));

    // Background tasks
    tokio::spawn(stats_task(shared.clone()));

    tracing::info!("🚀 SmartSession relay listening on http://{addr}");
    if let Err(e) = routes::serve(listener, shared).await {
        tracing::error!("Relay stopped: {e}");
    }
}

/// Every minute, log how many clients are attached.
async fn stats_task(state: Arc<RelayState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        tracing::info!(
            "Active: {} students, {} teachers",
            state.students.len(),
            state.teachers.len()
        );
    }
}

async fn run_student(cfg: Config, student_id: &str) {
    let camera = Arc::new(SyntheticCamera::new(cfg.frame_width, cfg.frame_height));
    let session = StudentSession::new(student_id, &cfg, camera, Arc::new(WsTransport));

    if let Err(e) = session.start_session() {
        tracing::error!("Could not start session: {e}");
        return;
    }

    let mut states = session.subscribe_state();
    let mut analysis = session.subscribe_analysis();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                tracing::info!("Session {state}");
                if matches!(state, ConnectionState::Disconnected | ConnectionState::Error) {
                    break;
                }
            }
            changed = analysis.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(a) = analysis.borrow_and_update().as_ref() {
                    tracing::info!(
                        "{:?} | {} | engagement {} | gaze {} | confidence {}%{}",
                        a.status,
                        a.emotion,
                        a.engagement_level,
                        a.gaze_direction,
                        a.confidence_percent(),
                        a.message.as_deref().map(|m| format!(" | {m}")).unwrap_or_default()
                    );
                }
            }
        }
    }

    session.stop_session().await;
}

async fn run_teacher(cfg: Config, teacher_id: &str) {
    let dashboard = DashboardAggregator::new(teacher_id, &cfg, Arc::new(WsTransport));
    if let Err(e) = dashboard.connect() {
        tracing::error!("Could not connect dashboard: {e}");
        return;
    }

    let mut states = dashboard.subscribe_state();
    let mut views = dashboard.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                tracing::info!("Dashboard {state}");
                if matches!(state, ConnectionState::Disconnected | ConnectionState::Error) {
                    break;
                }
            }
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                tracing::info!("{} active students, {} alerts", view.len(), view.alert_count());
                for s in view.students() {
                    let a = &s.latest_analysis;
                    tracing::info!(
                        "  {} [{:?}] {} / {} / gaze {} / confidence {}%",
                        s.student_id,
                        a.status,
                        a.emotion,
                        a.engagement_level,
                        a.gaze_direction,
                        a.confidence_percent()
                    );
                }
            }
        }
    }

    dashboard.disconnect();
}
