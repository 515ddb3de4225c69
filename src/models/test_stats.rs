use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Aggregate counters per test. Only ever touched through atomic
/// increments inside the grading transaction.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TestStats {
    pub test_id: Uuid,
    pub attempts_count: i64,
    pub pass_count: i64,
    pub score_sum: f64,
    pub recent_percentages: Vec<f64>,
    pub updated_at: Option<DateTime<Utc>>,
}
