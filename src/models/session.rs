use crate::error::{Error, Result};
use crate::models::snapshot::TestSnapshot;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Paused,
    Completed,
    Expired,
    Abandoned,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Expired => "expired",
            SessionStatus::Abandoned => "abandoned",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(SessionStatus::InProgress),
            "paused" => Some(SessionStatus::Paused),
            "completed" => Some(SessionStatus::Completed),
            "expired" => Some(SessionStatus::Expired),
            "abandoned" => Some(SessionStatus::Abandoned),
            "failed" => Some(SessionStatus::Failed),
            _ => None,
        }
    }

    /// A session that can still be rejoined.
    pub fn is_live(&self) -> bool {
        matches!(self, SessionStatus::InProgress | SessionStatus::Paused)
    }
}

/// One attempt by one student at one test. The snapshot column holds the
/// frozen test copy; `version` is the optimistic-concurrency counter every
/// mutation must CAS against.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: Uuid,
    pub test_id: Uuid,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub attempt_number: i32,
    pub status: String,
    pub snapshot: JsonValue,
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
    pub paused_at: Option<DateTime<Utc>>,
    pub time_remaining_at_pause_secs: Option<i64>,
    pub completed_at: Option<DateTime<Utc>>,
    pub final_score: Option<JsonValue>,
    pub version: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn status(&self) -> SessionStatus {
        SessionStatus::parse(&self.status).unwrap_or(SessionStatus::Failed)
    }

    /// Parses the embedded snapshot. A parse failure here is how a
    /// structurally corrupt session is detected during rejoin.
    pub fn snapshot(&self) -> Result<TestSnapshot> {
        serde_json::from_value(self.snapshot.clone())
            .map_err(|e| Error::Validation(format!("Corrupt session snapshot: {}", e)))
    }

    /// Remaining seconds against the overall deadline. While paused the
    /// frozen capture is reported; the deadline itself never moves, so
    /// disconnect time still counts once the session resumes.
    pub fn overall_remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        if self.status() == SessionStatus::Paused {
            if let Some(frozen) = self.time_remaining_at_pause_secs {
                return frozen.max(0);
            }
        }
        (self.expires_at - now).num_seconds().max(0)
    }

    /// Remaining seconds for the active section, when the test is
    /// sectioned and the section has its own budget. Never exceeds the
    /// overall remaining time. While paused the frozen overall capture is
    /// authoritative, so this reports nothing.
    pub fn section_remaining_seconds(
        &self,
        snapshot: &TestSnapshot,
        now: DateTime<Utc>,
    ) -> Option<i64> {
        if !snapshot.settings.use_sections || self.status() == SessionStatus::Paused {
            return None;
        }
        let section = snapshot.section(self.current_section_index as usize)?;
        let started = section.started_at?;
        let deadline = started + Duration::minutes(section.time_limit_minutes);
        let remaining = (deadline - now).num_seconds().max(0);
        Some(remaining.min(self.overall_remaining_seconds(now)))
    }
}
