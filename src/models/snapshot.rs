use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Immutable per-attempt copy of a test. Embedded in the session row as
/// JSONB; only student-progress fields and section status change after
/// creation, and nothing changes once grading has run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSnapshot {
    pub title: String,
    pub description: Option<String>,
    pub settings: SnapshotSettings,
    pub shuffle_seed: String,
    #[serde(default)]
    pub sections: Vec<SnapshotSection>,
    #[serde(default)]
    pub questions: Vec<SnapshotQuestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSettings {
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
pub struct SnapshotSection {
    pub name: String,
    pub time_limit_minutes: i64,
    pub status: SectionStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    pub questions: Vec<SnapshotQuestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotQuestion {
    pub question_id: i32,
    pub prompt: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub category: Option<QuestionCategory>,
    #[serde(default = "default_points")]
    pub points: f64,
    pub final_order: i32,
    #[serde(flatten)]
    pub payload: QuestionPayload,

    // Student progress, zeroed at snapshot time.
    #[serde(default)]
    pub student_answer: Option<JsonValue>,
    pub status: QuestionStatus,
    #[serde(default)]
    pub time_spent_seconds: i64,
    #[serde(default)]
    pub view_count: i32,
    #[serde(default)]
    pub first_viewed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_viewed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_correct: Option<bool>,
    #[serde(default)]
    pub points_earned: Option<f64>,
}

fn default_points() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "question_type", rename_all = "snake_case")]
pub enum QuestionPayload {
    MultipleChoice(MultipleChoicePayload),
    TrueFalse(TrueFalsePayload),
    FillInBlank(FillInBlankPayload),
    CodeChallenge(CodePayload),
    Debugging(CodePayload),
}

impl QuestionPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            QuestionPayload::MultipleChoice(_) => "multiple_choice",
            QuestionPayload::TrueFalse(_) => "true_false",
            QuestionPayload::FillInBlank(_) => "fill_in_blank",
            QuestionPayload::CodeChallenge(_) => "code_challenge",
            QuestionPayload::Debugging(_) => "debugging",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipleChoicePayload {
    pub options: Vec<String>,
    pub correct_answer: JsonValue,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrueFalsePayload {
    pub correct_answer: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillInBlankPayload {
    pub template: String,
    pub blanks: Vec<FillBlank>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillBlank {
    pub accepted_answers: Vec<String>,
    #[serde(default)]
    pub case_sensitive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodePayload {
    #[serde(default)]
    pub code_template: Option<String>,
    #[serde(default)]
    pub entry_function: Option<String>,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub test_cases: Vec<CodeTestCase>,
    #[serde(default = "default_code_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_code_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeTestCase {
    pub input: JsonValue,
    pub expected: JsonValue,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionCategory {
    Logic,
    Ui,
    Syntax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    NotViewed,
    Viewed,
    Answered,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    NotStarted,
    InProgress,
    Reviewing,
    Submitted,
}

impl SnapshotQuestion {
    /// Null, absent, and empty-string answers all count as unanswered.
    pub fn is_unanswered(&self) -> bool {
        match &self.student_answer {
            None => true,
            Some(JsonValue::Null) => true,
            Some(JsonValue::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        }
    }
}

impl TestSnapshot {
    pub fn section_count(&self) -> usize {
        if self.settings.use_sections {
            self.sections.len()
        } else {
            1
        }
    }

    pub fn questions_in(&self, section_index: usize) -> &[SnapshotQuestion] {
        if self.settings.use_sections {
            self.sections
                .get(section_index)
                .map(|s| s.questions.as_slice())
                .unwrap_or(&[])
        } else {
            &self.questions
        }
    }

    pub fn question_at(&self, section_index: usize, question_index: usize) -> Option<&SnapshotQuestion> {
        self.questions_in(section_index).get(question_index)
    }

    pub fn question_at_mut(
        &mut self,
        section_index: usize,
        question_index: usize,
    ) -> Option<&mut SnapshotQuestion> {
        if self.settings.use_sections {
            self.sections
                .get_mut(section_index)?
                .questions
                .get_mut(question_index)
        } else {
            self.questions.get_mut(question_index)
        }
    }

    pub fn section(&self, index: usize) -> Option<&SnapshotSection> {
        self.sections.get(index)
    }

    pub fn section_mut(&mut self, index: usize) -> Option<&mut SnapshotSection> {
        self.sections.get_mut(index)
    }

    pub fn total_question_count(&self) -> usize {
        if self.settings.use_sections {
            self.sections.iter().map(|s| s.questions.len()).sum()
        } else {
            self.questions.len()
        }
    }

    pub fn all_questions(&self) -> Vec<&SnapshotQuestion> {
        if self.settings.use_sections {
            self.sections
                .iter()
                .flat_map(|s| s.questions.iter())
                .collect()
        } else {
            self.questions.iter().collect()
        }
    }

    /// Converts a section-relative cursor to the position within the whole
    /// test, used only for the legacy answered/skipped reporting arrays.
    pub fn global_index(&self, section_index: usize, question_index: usize) -> usize {
        if !self.settings.use_sections {
            return question_index;
        }
        let before: usize = self
            .sections
            .iter()
            .take(section_index)
            .map(|s| s.questions.len())
            .sum();
        before + question_index
    }

    /// Derived view: global indices of answered questions. Computed from
    /// question statuses rather than maintained as independent state.
    pub fn answered_global_indices(&self) -> Vec<i32> {
        self.global_indices_with_status(QuestionStatus::Answered)
    }

    /// Derived view: global indices of skipped questions.
    pub fn skipped_global_indices(&self) -> Vec<i32> {
        self.global_indices_with_status(QuestionStatus::Skipped)
    }

    fn global_indices_with_status(&self, status: QuestionStatus) -> Vec<i32> {
        self.all_questions()
            .iter()
            .enumerate()
            .filter(|(_, q)| q.status == status)
            .map(|(i, _)| i as i32)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(id: i32, status: QuestionStatus) -> SnapshotQuestion {
        SnapshotQuestion {
            question_id: id,
            prompt: format!("q{}", id),
            language: None,
            difficulty: None,
            category: None,
            points: 1.0,
            final_order: id,
            payload: QuestionPayload::TrueFalse(TrueFalsePayload {
                correct_answer: serde_json::json!(0),
            }),
            student_answer: None,
            status,
            time_spent_seconds: 0,
            view_count: 0,
            first_viewed_at: None,
            last_viewed_at: None,
            is_correct: None,
            points_earned: None,
        }
    }

    fn sectioned_snapshot() -> TestSnapshot {
        TestSnapshot {
            title: "t".into(),
            description: None,
            settings: SnapshotSettings {
                time_limit_minutes: 30,
                attempts_allowed: 1,
                shuffle_questions: false,
                use_sections: true,
                passing_score: 70.0,
            },
            shuffle_seed: "00".into(),
            sections: vec![
                SnapshotSection {
                    name: "A".into(),
                    time_limit_minutes: 10,
                    status: SectionStatus::Submitted,
                    started_at: None,
                    submitted_at: None,
                    questions: vec![
                        question(1, QuestionStatus::Answered),
                        question(2, QuestionStatus::Skipped),
                    ],
                },
                SnapshotSection {
                    name: "B".into(),
                    time_limit_minutes: 10,
                    status: SectionStatus::InProgress,
                    started_at: None,
                    submitted_at: None,
                    questions: vec![
                        question(3, QuestionStatus::Answered),
                        question(4, QuestionStatus::NotViewed),
                    ],
                },
            ],
            questions: vec![],
        }
    }

    #[test]
    fn global_index_is_section_offset_plus_relative() {
        let snap = sectioned_snapshot();
        assert_eq!(snap.global_index(0, 1), 1);
        assert_eq!(snap.global_index(1, 0), 2);
        assert_eq!(snap.global_index(1, 1), 3);
    }

    #[test]
    fn answered_and_skipped_views_are_derived_from_statuses() {
        let snap = sectioned_snapshot();
        assert_eq!(snap.answered_global_indices(), vec![0, 2]);
        assert_eq!(snap.skipped_global_indices(), vec![1]);
    }

    #[test]
    fn empty_string_answer_counts_as_unanswered() {
        let mut q = question(1, QuestionStatus::Answered);
        q.student_answer = Some(serde_json::json!("   "));
        assert!(q.is_unanswered());
        q.student_answer = Some(serde_json::json!("A"));
        assert!(!q.is_unanswered());
    }

    #[test]
    fn payload_round_trips_with_type_tag() {
        let q = question(7, QuestionStatus::NotViewed);
        let v = serde_json::to_value(&q).unwrap();
        assert_eq!(v["question_type"], "true_false");
        let back: SnapshotQuestion = serde_json::from_value(v).unwrap();
        assert_eq!(back.question_id, 7);
    }
}
