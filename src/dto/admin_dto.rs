use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::session::Session;

/// Full session detail for instructors/admins, org-scoped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSessionResponse {
    pub id: Uuid,
    pub test_id: Uuid,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub attempt_number: i32,
    pub status: String,
    pub current_section_index: i32,
    pub current_question_index: i32,
    pub completed_sections: Vec<i32>,
    pub review_phase: bool,
    pub is_connected: bool,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub grace_expired: bool,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub final_score: Option<JsonValue>,
    pub snapshot: JsonValue,
    pub version: i64,
}

impl From<Session> for AdminSessionResponse {
    fn from(s: Session) -> Self {
        Self {
            id: s.id,
            test_id: s.test_id,
            user_id: s.user_id,
            organization_id: s.organization_id,
            attempt_number: s.attempt_number,
            status: s.status,
            current_section_index: s.current_section_index,
            current_question_index: s.current_question_index,
            completed_sections: s.completed_sections,
            review_phase: s.review_phase,
            is_connected: s.is_connected,
            disconnected_at: s.disconnected_at,
            last_connected_at: s.last_connected_at,
            grace_expired: s.grace_expired,
            started_at: s.started_at,
            expires_at: s.expires_at,
            completed_at: s.completed_at,
            final_score: s.final_score,
            snapshot: s.snapshot,
            version: s.version,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestStatsResponse {
    pub test_id: Uuid,
    pub attempts_count: i64,
    pub pass_count: i64,
    pub average_percentage: f64,
    pub recent_percentages: Vec<f64>,
}
