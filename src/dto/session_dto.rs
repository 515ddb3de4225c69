use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;
use validator::Validate;

use crate::models::session::Session;
use crate::models::session_result::FinalScore;
use crate::models::snapshot::{QuestionPayload, QuestionStatus, SnapshotQuestion, TestSnapshot};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StartSessionRequest {
    pub test_id: Uuid,
    #[serde(default)]
    pub force_new: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubmitAnswerRequest {
    pub question_index: i32,
    pub answer: JsonValue,
    #[serde(default)]
    pub time_spent_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SkipQuestionRequest {
    pub question_index: i32,
    #[serde(default)]
    pub time_spent_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NavigateRequest {
    pub question_index: i32,
}

/// Student-visible projection of a snapshot question. Correct answers,
/// accepted blank answers, and hidden test cases never leave the server
/// while a session is active, regardless of caller role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizedQuestion {
    pub question_id: i32,
    pub question_type: String,
    pub prompt: String,
    pub language: Option<String>,
    pub difficulty: Option<String>,
    pub points: f64,
    pub status: QuestionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blank_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_test_cases: Option<Vec<SampleTestCase>>,
    pub student_answer: Option<JsonValue>,
    pub time_spent_seconds: i64,
    pub view_count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleTestCase {
    pub input: JsonValue,
    pub expected: JsonValue,
}

impl SanitizedQuestion {
    pub fn from_snapshot(q: &SnapshotQuestion) -> Self {
        let mut sanitized = Self {
            question_id: q.question_id,
            question_type: q.payload.type_name().to_string(),
            prompt: q.prompt.clone(),
            language: q.language.clone(),
            difficulty: q.difficulty.clone(),
            points: q.points,
            status: q.status,
            options: None,
            template: None,
            blank_count: None,
            code_template: None,
            runtime: None,
            sample_test_cases: None,
            student_answer: q.student_answer.clone(),
            time_spent_seconds: q.time_spent_seconds,
            view_count: q.view_count,
        };
        match &q.payload {
            QuestionPayload::MultipleChoice(mc) => {
                sanitized.options = Some(mc.options.clone());
            }
            QuestionPayload::TrueFalse(_) => {
                sanitized.options = Some(vec!["True".to_string(), "False".to_string()]);
            }
            QuestionPayload::FillInBlank(fib) => {
                sanitized.template = Some(fib.template.clone());
                sanitized.blank_count = Some(fib.blanks.len());
            }
            QuestionPayload::CodeChallenge(code) | QuestionPayload::Debugging(code) => {
                sanitized.code_template = code.code_template.clone();
                sanitized.runtime = code.runtime.clone();
                sanitized.sample_test_cases = Some(
                    code.test_cases
                        .iter()
                        .filter(|tc| !tc.hidden)
                        .map(|tc| SampleTestCase {
                            input: tc.input.clone(),
                            expected: tc.expected.clone(),
                        })
                        .collect(),
                );
            }
        }
        sanitized
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentQuestionResponse {
    pub question: SanitizedQuestion,
    pub section_index: i32,
    pub question_index: i32,
    pub section_name: Option<String>,
    pub section_question_count: usize,
    pub review_phase: bool,
    pub time_remaining_seconds: i64,
    pub section_time_remaining_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionSummaryResponse {
    pub section_index: i32,
    pub name: String,
    pub question_count: usize,
    pub answered: usize,
    pub skipped: usize,
    pub unanswered_indices: Vec<i32>,
    pub time_remaining_seconds: Option<i64>,
}

/// Outcome of an answer/skip submission. `already_processed` is the
/// idempotent replay response, not an error: the client's previous
/// request landed but its response was lost.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AnswerOutcome {
    Advanced {
        next: Box<CurrentQuestionResponse>,
    },
    SavedInReview {
        question_index: i32,
    },
    SectionReview {
        summary: SectionSummaryResponse,
    },
    ConfirmSubmit {
        unanswered_indices: Vec<i32>,
    },
    ReadyToSubmit,
    AlreadyProcessed {
        current: Box<CurrentQuestionResponse>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitSectionResponse {
    pub submitted_section_index: i32,
    pub advanced_to_section: Option<i32>,
    pub test_complete: bool,
    pub time_remaining_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTestResponse {
    pub session_id: Uuid,
    pub status: String,
    pub final_score: FinalScore,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSyncResponse {
    pub session_id: Uuid,
    pub status: String,
    pub time_remaining_seconds: i64,
    pub section_time_remaining_seconds: Option<i64>,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
    pub resumed: bool,
    pub time_remaining_seconds: i64,
}

/// Reduced session shape for students: progress and timing, no snapshot
/// internals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub id: Uuid,
    pub test_id: Uuid,
    pub attempt_number: i32,
    pub status: String,
    pub title: String,
    pub current_section_index: i32,
    pub current_question_index: i32,
    pub review_phase: bool,
    pub completed_sections: Vec<i32>,
    pub total_questions: usize,
    pub answered_questions: Vec<i32>,
    pub skipped_questions: Vec<i32>,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub time_remaining_seconds: i64,
    pub section_time_remaining_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_score: Option<JsonValue>,
}

impl SessionResponse {
    pub fn from_session(session: &Session, snapshot: &TestSnapshot) -> Self {
        let now = Utc::now();
        Self {
            id: session.id,
            test_id: session.test_id,
            attempt_number: session.attempt_number,
            status: session.status.clone(),
            title: snapshot.title.clone(),
            current_section_index: session.current_section_index,
            current_question_index: session.current_question_index,
            review_phase: session.review_phase,
            completed_sections: session.completed_sections.clone(),
            total_questions: snapshot.total_question_count(),
            answered_questions: snapshot.answered_global_indices(),
            skipped_questions: snapshot.skipped_global_indices(),
            started_at: session.started_at,
            expires_at: session.expires_at,
            time_remaining_seconds: session.overall_remaining_seconds(now),
            section_time_remaining_seconds: session.section_remaining_seconds(snapshot, now),
            final_score: session.final_score.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub session: SessionResponse,
    pub current_question: CurrentQuestionResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejoinCheckResponse {
    pub rejoinable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionResponse>,
    pub recovered: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::snapshot::{
        CodePayload, CodeTestCase, FillBlank, FillInBlankPayload, MultipleChoicePayload,
    };
    use serde_json::json;

    fn base_question(payload: QuestionPayload) -> SnapshotQuestion {
        SnapshotQuestion {
            question_id: 1,
            prompt: "p".into(),
            language: None,
            difficulty: None,
            category: None,
            points: 1.0,
            final_order: 0,
            payload,
            student_answer: None,
            status: QuestionStatus::NotViewed,
            time_spent_seconds: 0,
            view_count: 0,
            first_viewed_at: None,
            last_viewed_at: None,
            is_correct: None,
            points_earned: None,
        }
    }

    #[test]
    fn multiple_choice_projection_hides_the_correct_answer() {
        let q = base_question(QuestionPayload::MultipleChoice(MultipleChoicePayload {
            options: vec!["A".into(), "B".into()],
            correct_answer: json!("A"),
            explanation: Some("because".into()),
        }));
        let sanitized = SanitizedQuestion::from_snapshot(&q);
        let v = serde_json::to_value(&sanitized).unwrap();
        assert_eq!(v["options"], json!(["A", "B"]));
        assert!(v.get("correct_answer").is_none());
        assert!(v.get("explanation").is_none());
    }

    #[test]
    fn blank_projection_exposes_count_but_not_answers() {
        let q = base_question(QuestionPayload::FillInBlank(FillInBlankPayload {
            template: "x is ___".into(),
            blanks: vec![FillBlank {
                accepted_answers: vec!["secret".into()],
                case_sensitive: false,
            }],
        }));
        let v = serde_json::to_value(SanitizedQuestion::from_snapshot(&q)).unwrap();
        assert_eq!(v["blank_count"], 1);
        assert!(v.to_string().find("secret").is_none());
    }

    #[test]
    fn hidden_test_cases_are_stripped() {
        let q = base_question(QuestionPayload::CodeChallenge(CodePayload {
            code_template: Some("fn main() {}".into()),
            entry_function: Some("main".into()),
            runtime: Some("node18".into()),
            test_cases: vec![
                CodeTestCase {
                    input: json!([1, 2]),
                    expected: json!(3),
                    hidden: false,
                },
                CodeTestCase {
                    input: json!([40, 2]),
                    expected: json!(42),
                    hidden: true,
                },
            ],
            timeout_ms: 5000,
        }));
        let sanitized = SanitizedQuestion::from_snapshot(&q);
        assert_eq!(sanitized.sample_test_cases.as_ref().unwrap().len(), 1);
    }
}
