use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

use crate::dashboard::DashboardView;
use crate::error::SessionError;

pub const UNKNOWN: &str = "Unknown";
pub const JPEG_MIME: &str = "image/jpeg";

// ── Session ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Teacher,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Error => "error",
        }
    }

    /// A channel is opening or open.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Streaming
        )
    }

    pub fn can_send(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Streaming)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One client's participation under a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: String,
    pub role: Role,
    pub connection_state: ConnectionState,
}

// ── Analysis ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Good,
    Warning,
    Alert,
    #[default]
    #[serde(other)]
    Unknown,
}

/// One judgment about a student, produced by the relay's analyzer.
///
/// Every field has a default so a partial record (or `{}`) still decodes and
/// renders as "Unknown" rather than failing. `confidence` and
/// `confusion_score` are expected in `[0, 1]`; out-of-range values are kept as
/// received, see [`AnalysisResult::scores_in_range`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisResult {
    pub student_id: String,
    #[serde(deserialize_with = "wire_time::deserialize")]
    pub timestamp: Option<DateTime<Utc>>,
    pub status: AnalysisStatus,
    pub emotion: String,
    pub engagement_level: String,
    pub gaze_direction: String,
    pub confidence: f64,
    pub confusion_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub confusion_indicators: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_count: Option<u32>,
}

impl Default for AnalysisResult {
    fn default() -> Self {
        Self {
            student_id: String::new(),
            timestamp: None,
            status: AnalysisStatus::Unknown,
            emotion: UNKNOWN.to_string(),
            engagement_level: UNKNOWN.to_string(),
            gaze_direction: UNKNOWN.to_string(),
            confidence: 0.0,
            confusion_score: 0.0,
            message: None,
            confusion_indicators: BTreeSet::new(),
            alert_type: None,
            face_count: None,
        }
    }
}

impl AnalysisResult {
    pub fn confidence_percent(&self) -> i64 {
        (self.confidence * 100.0).round() as i64
    }

    pub fn confusion_percent(&self) -> i64 {
        (self.confusion_score * 100.0).round() as i64
    }

    /// Upstream contract check. Values are never clamped here.
    pub fn scores_in_range(&self) -> bool {
        (0.0..=1.0).contains(&self.confidence) && (0.0..=1.0).contains(&self.confusion_score)
    }
}

/// Latest known state of one student as seen by a teacher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentState {
    #[serde(default)]
    pub student_id: String,
    #[serde(default)]
    pub latest_analysis: AnalysisResult,
    #[serde(default, deserialize_with = "wire_time::deserialize")]
    pub last_update: Option<DateTime<Utc>>,
}

impl StudentState {
    pub fn from_analysis(analysis: AnalysisResult) -> Self {
        Self {
            student_id: analysis.student_id.clone(),
            last_update: analysis.timestamp,
            latest_analysis: analysis,
        }
    }

    pub fn status(&self) -> AnalysisStatus {
        self.latest_analysis.status
    }
}

// ── Frame ────────────────────────────────────────────────

/// One encoded still. Produced, sent, dropped.
#[derive(Debug, Clone)]
pub struct Frame {
    pub captured_at: DateTime<Utc>,
    pub encoding: &'static str,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn jpeg(payload: Vec<u8>) -> Self {
        Self {
            captured_at: Utc::now(),
            encoding: JPEG_MIME,
            payload,
        }
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.encoding, STANDARD.encode(&self.payload))
    }
}

/// Accepts either a `data:...;base64,` URL or bare base64.
pub fn decode_frame_payload(frame: &str) -> Result<Vec<u8>, SessionError> {
    let b64 = match frame.split_once(',') {
        Some((_, rest)) => rest,
        None => frame,
    };
    STANDARD
        .decode(b64.trim())
        .map_err(|e| SessionError::Encode(format!("bad base64 frame: {e}")))
}

// ── Wire ─────────────────────────────────────────────────

/// Client → relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    VideoFrame { frame: String },
    Ping,
    RequestState,
}

/// Relay → client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    AnalysisResult(AnalysisResult),
    InitialState(DashboardView),
    StudentUpdate(AnalysisResult),
    StudentDisconnected {
        student_id: String,
        timestamp: DateTime<Utc>,
    },
    StateUpdate(DashboardView),
    Pong,
}

impl ServerMessage {
    /// `None` (logged) if the message cannot be serialized; nothing is sent then.
    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::error!("could not serialize server message: {e}");
                None
            }
        }
    }
}

/// First-stage parse of any inbound record: the discriminator plus its raw payload.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Inbound events for the student role.
#[derive(Debug, Clone, PartialEq)]
pub enum StudentEvent {
    AnalysisResult(AnalysisResult),
}

impl StudentEvent {
    /// `Ok(None)` for kinds this role doesn't know.
    pub fn from_wire(kind: &str, data: Value) -> Result<Option<Self>, SessionError> {
        match kind {
            "analysis_result" => {
                let analysis: AnalysisResult = serde_json::from_value(data)
                    .map_err(|e| SessionError::Protocol(format!("analysis_result: {e}")))?;
                Ok(Some(StudentEvent::AnalysisResult(analysis)))
            }
            _ => Ok(None),
        }
    }
}

/// Inbound events for the teacher role.
#[derive(Debug, Clone, PartialEq)]
pub enum DashboardEvent {
    InitialState(DashboardView),
    StudentUpdate(AnalysisResult),
    StudentDisconnected { student_id: String },
}

#[derive(Deserialize)]
struct DisconnectedPayload {
    student_id: String,
}

impl DashboardEvent {
    /// `Ok(None)` for kinds this role doesn't know.
    pub fn from_wire(kind: &str, data: Value) -> Result<Option<Self>, SessionError> {
        let event = match kind {
            "initial_state" => {
                let view: DashboardView = serde_json::from_value(data)
                    .map_err(|e| SessionError::Protocol(format!("initial_state: {e}")))?;
                DashboardEvent::InitialState(view.with_keyed_ids())
            }
            "student_update" => {
                let analysis: AnalysisResult = serde_json::from_value(data)
                    .map_err(|e| SessionError::Protocol(format!("student_update: {e}")))?;
                if analysis.student_id.is_empty() {
                    return Err(SessionError::Protocol(
                        "student_update without student_id".into(),
                    ));
                }
                DashboardEvent::StudentUpdate(analysis)
            }
            "student_disconnected" => {
                let payload: DisconnectedPayload = serde_json::from_value(data)
                    .map_err(|e| SessionError::Protocol(format!("student_disconnected: {e}")))?;
                DashboardEvent::StudentDisconnected {
                    student_id: payload.student_id,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

pub(crate) mod wire_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    /// RFC 3339, or a naive ISO-8601 stamp taken as UTC.
    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|n| n.and_utc())
            })
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(d)? {
            None => Ok(None),
            Some(raw) if raw.is_empty() => Ok(None),
            Some(raw) => parse(&raw)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid timestamp: {raw}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn empty_analysis_decodes_as_unknown() {
        let a: AnalysisResult = serde_json::from_value(json!({})).unwrap();
        assert_eq!(a.status, AnalysisStatus::Unknown);
        assert_eq!(a.emotion, UNKNOWN);
        assert_eq!(a.engagement_level, UNKNOWN);
        assert!(a.message.is_none());
        assert!(a.confusion_indicators.is_empty());
        assert!(a.timestamp.is_none());
    }

    #[test]
    fn analysis_decodes_backend_record() {
        let a: AnalysisResult = serde_json::from_value(json!({
            "student_id": "s1",
            "timestamp": "2025-01-15T10:30:00.123456",
            "face_count": 1,
            "face_detected": true,
            "status": "warning",
            "alert_type": "confused",
            "confidence": 0.85,
            "gaze_direction": "center",
            "emotion": "confused",
            "confusion_score": 0.62,
            "confusion_indicators": ["brow_furrow", "lip_press", "brow_furrow"],
            "engagement_level": "struggling",
            "message": "Student appears confused"
        }))
        .unwrap();
        assert_eq!(a.status, AnalysisStatus::Warning);
        assert_eq!(a.confusion_indicators.len(), 2);
        assert_eq!(a.confidence_percent(), 85);
        assert_eq!(a.confusion_percent(), 62);
        assert_eq!(a.face_count, Some(1));
        let expected = Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 0).unwrap()
            + chrono::Duration::microseconds(123_456);
        assert_eq!(a.timestamp, Some(expected));
    }

    #[test]
    fn unrecognised_status_is_unknown() {
        let a: AnalysisResult = serde_json::from_value(json!({ "status": "sleepy" })).unwrap();
        assert_eq!(a.status, AnalysisStatus::Unknown);
    }

    #[test]
    fn out_of_range_scores_are_kept_not_clamped() {
        let a: AnalysisResult =
            serde_json::from_value(json!({ "confidence": 1.4, "confusion_score": -0.1 })).unwrap();
        assert!(!a.scores_in_range());
        assert_eq!(a.confidence, 1.4);
        assert_eq!(a.confusion_score, -0.1);
    }

    #[test]
    fn video_frame_wire_shape() {
        let msg = ClientMessage::VideoFrame {
            frame: Frame::jpeg(vec![0xff, 0xd8, 0xff]).to_data_url(),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "video_frame");
        assert_eq!(v["frame"], "data:image/jpeg;base64,/9j/");
    }

    #[test]
    fn frame_payload_accepts_data_url_and_bare_base64() {
        assert_eq!(decode_frame_payload("data:image/jpeg;base64,/9j/").unwrap(), vec![0xff, 0xd8, 0xff]);
        assert_eq!(decode_frame_payload("/9j/").unwrap(), vec![0xff, 0xd8, 0xff]);
        assert!(decode_frame_payload("data:image/jpeg;base64,@@@").is_err());
    }

    #[test]
    fn server_messages_use_type_and_data() {
        let v = serde_json::to_value(ServerMessage::StudentDisconnected {
            student_id: "s9".into(),
            timestamp: Utc::now(),
        })
        .unwrap();
        assert_eq!(v["type"], "student_disconnected");
        assert_eq!(v["data"]["student_id"], "s9");

        let pong = serde_json::to_value(ServerMessage::Pong).unwrap();
        assert_eq!(pong, json!({ "type": "pong" }));
        assert_eq!(ServerMessage::Pong.to_json().as_deref(), Some(r#"{"type":"pong"}"#));
    }

    #[test]
    fn unknown_kinds_are_not_errors() {
        assert!(DashboardEvent::from_wire("state_update", json!({})).unwrap().is_none());
        assert!(StudentEvent::from_wire("pong", Value::Null).unwrap().is_none());
    }

    #[test]
    fn malformed_known_kinds_are_protocol_errors() {
        let err = DashboardEvent::from_wire("student_disconnected", json!({ "id": 3 })).unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
        let err = DashboardEvent::from_wire("student_update", json!({ "status": "good" })).unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
        let err = StudentEvent::from_wire("analysis_result", json!({ "confidence": "high" })).unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
    }
}
