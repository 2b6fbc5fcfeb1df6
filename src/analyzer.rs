use image::DynamicImage;

use crate::error::SessionError;
use crate::models::{decode_frame_payload, AnalysisResult};

/// The inference engine behind the relay. Opaque to the rest of the crate;
/// only its output record matters.
pub trait FrameAnalyzer: Send + Sync {
    fn is_ready(&self) -> bool {
        true
    }

    /// `student_id` and `timestamp` are stamped by the relay afterwards.
    fn analyze(&self, student_id: &str, frame: &DynamicImage) -> AnalysisResult;
}

/// Emits the neutral record every analysis starts from: unknown status,
/// neutral emotion, centered gaze, zero confidence.
#[derive(Debug, Clone, Default)]
pub struct BaselineAnalyzer;

impl FrameAnalyzer for BaselineAnalyzer {
    fn analyze(&self, student_id: &str, _frame: &DynamicImage) -> AnalysisResult {
        AnalysisResult {
            student_id: student_id.to_string(),
            emotion: "neutral".into(),
            engagement_level: "unknown".into(),
            gaze_direction: "center".into(),
            ..AnalysisResult::default()
        }
    }
}

/// Data URL (or bare base64) → decoded image.
pub fn decode_frame(frame: &str) -> Result<DynamicImage, SessionError> {
    let bytes = decode_frame_payload(frame)?;
    image::load_from_memory(&bytes).map_err(|e| SessionError::Encode(e.to_string()))
}
