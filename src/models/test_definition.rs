use crate::error::{Error, Result};
use crate::models::snapshot::QuestionPayload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use uuid::Uuid;

/// A resolved test definition as the content-authoring service stores it.
/// Read-only at snapshot time.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TestRow {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub is_global: bool,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub settings: JsonValue,
    pub sections: Option<JsonValue>,
    pub questions: Option<JsonValue>,
    pub created_by: Option<Uuid>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSettings {
    pub time_limit_minutes: i64,
    pub attempts_allowed: i32,
    #[serde(default)]
    pub shuffle_questions: bool,
    #[serde(default)]
    pub use_sections: bool,
    #[serde(default = "default_passing_score")]
    pub passing_score: f64,
}

fn default_passing_score() -> f64 {
    70.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionSection {
    pub name: String,
    pub time_limit_minutes: i64,
    pub questions: Vec<DefinitionQuestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionQuestion {
    #[serde(default)]
    pub question_id: i32,
    pub prompt: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub category: Option<crate::models::snapshot::QuestionCategory>,
    #[serde(default = "default_points")]
    pub points: f64,
    #[serde(flatten)]
    pub payload: QuestionPayload,
}

fn default_points() -> f64 {
    1.0
}

impl TestRow {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }

    pub fn settings(&self) -> Result<TestSettings> {
        serde_json::from_value(self.settings.clone())
            .map_err(|e| Error::Validation(format!("Malformed test settings: {}", e)))
    }

    pub fn definition_sections(&self) -> Result<Vec<DefinitionSection>> {
        let Some(raw) = &self.sections else {
            return Err(Error::Validation(
                "Sectioned test is missing its sections definition".to_string(),
            ));
        };
        serde_json::from_value(raw.clone())
            .map_err(|e| Error::Validation(format!("Malformed test sections: {}", e)))
    }

    pub fn definition_questions(&self) -> Result<Vec<DefinitionQuestion>> {
        let Some(raw) = &self.questions else {
            return Err(Error::Validation(
                "Test is missing its questions definition".to_string(),
            ));
        };
        serde_json::from_value(raw.clone())
            .map_err(|e| Error::Validation(format!("Malformed test questions: {}", e)))
    }
}
