use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::models::Role;

/// What happens to an outbound message when the socket can't keep up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Unbounded queue, nothing is dropped before the socket.
    Queue,
    /// Bounded queue of `outbound_buffer` messages; new messages that don't fit are dropped.
    DropNewest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend_url: String,
    pub session_path: String,
    pub port: u16,
    pub frame_interval_ms: u64,
    pub jpeg_quality: u8,
    pub frame_width: u32,
    pub frame_height: u32,
    pub overflow: OverflowPolicy,
    pub outbound_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend_url: "ws://localhost:8000".to_string(),
            session_path: "/ws".to_string(),
            port: 8000,
            frame_interval_ms: 200,
            jpeg_quality: 80,
            frame_width: 640,
            frame_height: 480,
            overflow: OverflowPolicy::Queue,
            outbound_buffer: 8,
        }
    }
}

impl Config {
    /// `{backend_url}{session_path}/{role}/{id}`
    pub fn endpoint(&self, role: Role, id: &str) -> String {
        format!(
            "{}{}/{}/{}",
            self.backend_url.trim_end_matches('/'),
            self.session_path.trim_end_matches('/'),
            role.as_str(),
            id
        )
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }
}

pub fn load_config() -> Config {
    load_config_from("config.toml")
}

pub fn load_config_from(path: impl AsRef<Path>) -> Config {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse {}: {e}, using defaults", path.display());
            Config::default()
        }),
        Err(_) => {
            tracing::info!("No {} found, using defaults", path.display());
            Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults_for_missing_keys() {
        let cfg: Config = toml::from_str(
            r#"
            frame_interval_ms = 500
            overflow = "drop_newest"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.frame_interval(), Duration::from_millis(500));
        assert_eq!(cfg.overflow, OverflowPolicy::DropNewest);
        assert_eq!(cfg.jpeg_quality, 80);
        assert_eq!(cfg.port, 8000);
    }

    #[test]
    fn endpoint_joins_role_and_id() {
        let cfg = Config {
            backend_url: "ws://relay.local:9000/".into(),
            ..Config::default()
        };
        assert_eq!(
            cfg.endpoint(Role::Student, "s-17"),
            "ws://relay.local:9000/ws/student/s-17"
        );
        assert_eq!(
            cfg.endpoint(Role::Teacher, "t1"),
            "ws://relay.local:9000/ws/teacher/t1"
        );
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = load_config_from("/nonexistent/smartsession.toml");
        assert_eq!(cfg.frame_interval_ms, 200);
        assert_eq!(cfg.overflow, OverflowPolicy::Queue);
    }
}
