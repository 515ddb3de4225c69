use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use uuid::Uuid;

/// Durable grading artifact. One row per finalized session, enforced by a
/// unique constraint on session_id; never updated by this engine.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionResult {
    pub id: Uuid,
    pub session_id: Uuid,
    pub test_id: Uuid,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub attempt_number: i32,
    pub outcome: String,
    pub question_results: JsonValue,
    pub earned_points: f64,
    pub total_points: f64,
    pub percentage: f64,
    pub passed: bool,
    pub correct_count: i32,
    pub incorrect_count: i32,
    pub unanswered_count: i32,
    pub created_at: Option<DateTime<Utc>>,
}

/// Per-question grading detail embedded in the result row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionResult {
    pub question_id: i32,
    pub question_type: String,
    pub prompt: String,
    pub student_answer: Option<JsonValue>,
    pub correct_answer: Option<JsonValue>,
    pub is_correct: bool,
    pub points_earned: f64,
    pub max_points: f64,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default)]
    pub unanswered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalScore {
    pub earned_points: f64,
    pub total_points: f64,
    pub percentage: f64,
    pub passed: bool,
    pub correct_count: i32,
    pub incorrect_count: i32,
    pub unanswered_count: i32,
}
