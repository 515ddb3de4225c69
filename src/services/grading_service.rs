use crate::error::{Error, Result};
use crate::models::session::{Session, SessionStatus};
use crate::models::session_result::{FinalScore, QuestionResult, SessionResult};
use crate::models::snapshot::{
    FillInBlankPayload, QuestionCategory, QuestionPayload, SnapshotQuestion,
};
use crate::services::sandbox_service::{SandboxRequest, SandboxService};
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Expired,
    Abandoned,
}

impl SessionOutcome {
    pub fn status(self) -> SessionStatus {
        match self {
            SessionOutcome::Completed => SessionStatus::Completed,
            SessionOutcome::Expired => SessionStatus::Expired,
            SessionOutcome::Abandoned => SessionStatus::Abandoned,
        }
    }

    fn allowed_from(self) -> &'static [&'static str] {
        match self {
            SessionOutcome::Completed => &["in_progress"],
            SessionOutcome::Expired | SessionOutcome::Abandoned => &["in_progress", "paused"],
        }
    }
}

/// Normalized answer operand for choice comparison: numeric strings become
/// numbers, everything else compares case-insensitively.
#[derive(Debug, Clone, PartialEq)]
pub enum ChoiceValue {
    Number(f64),
    Text(String),
    Missing,
}

#[derive(Clone)]
pub struct GradingService {
    pool: PgPool,
    sandbox: SandboxService,
}

impl GradingService {
    pub fn new(pool: PgPool, sandbox: SandboxService) -> Self {
        Self { pool, sandbox }
    }

    /// Grades every question, writes the final score, creates the Result
    /// row, and bumps the test aggregates, with all writes in one
    /// transaction. The `WHERE status = ANY(..)` guard on the status flip
    /// is what makes concurrent submits grade at most once.
    pub async fn finalize_session(
        &self,
        session_id: Uuid,
        outcome: SessionOutcome,
        force: bool,
    ) -> Result<(SessionResult, FinalScore)> {
        let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound("Session not found".to_string()))?;

        let allowed = outcome.allowed_from();
        if !allowed.contains(&session.status.as_str()) {
            return Err(if session.status().is_live() {
                Error::InvalidState(format!(
                    "Session cannot be finalized as {} from status {}",
                    outcome.status().as_str(),
                    session.status
                ))
            } else {
                Error::Conflict(format!("Session is already {}", session.status))
            });
        }

        let mut snapshot = session.snapshot()?;
        let now = Utc::now();

        if snapshot.settings.use_sections {
            let unsubmitted: Vec<usize> = snapshot
                .sections
                .iter()
                .enumerate()
                .filter(|(_, s)| s.status != crate::models::snapshot::SectionStatus::Submitted)
                .map(|(i, _)| i)
                .collect();
            if !unsubmitted.is_empty() {
                if !force {
                    return Err(Error::InvalidState(
                        "Cannot submit: one or more sections have not been submitted".to_string(),
                    ));
                }
                for i in unsubmitted {
                    let section = &mut snapshot.sections[i];
                    section.status = crate::models::snapshot::SectionStatus::Submitted;
                    section.submitted_at = Some(now);
                }
            }
        }
        let completed_sections: Vec<i32> = if snapshot.settings.use_sections {
            (0..snapshot.sections.len() as i32).collect()
        } else {
            session.completed_sections.clone()
        };

        // Sandbox calls happen here, before the transaction opens; only
        // the writes below run inside it.
        let use_sections = snapshot.settings.use_sections;
        let mut question_results: Vec<QuestionResult> = Vec::new();
        let questions: Vec<&mut SnapshotQuestion> = if use_sections {
            snapshot
                .sections
                .iter_mut()
                .flat_map(|s| s.questions.iter_mut())
                .collect()
        } else {
            snapshot.questions.iter_mut().collect()
        };
        for q in questions {
            let graded = self.grade_question(q).await;
            q.is_correct = Some(graded.is_correct);
            q.points_earned = Some(graded.points_earned);
            question_results.push(graded);
        }

        let final_score = Self::score(&question_results, snapshot.settings.passing_score);

        let snapshot_json = serde_json::to_value(&snapshot)?;
        let final_json = serde_json::to_value(&final_score)?;
        let results_json = serde_json::to_value(&question_results)?;
        let allowed_vec: Vec<String> = allowed.iter().map(|s| s.to_string()).collect();

        let mut tx = self.pool.begin().await?;

        let flipped = sqlx::query(
            r#"
            UPDATE sessions
            SET snapshot = $1, status = $2, final_score = $3, completed_at = $4,
                completed_sections = $5, review_phase = FALSE, is_connected = FALSE,
                version = version + 1, updated_at = NOW()
            WHERE id = $6 AND status = ANY($7)
            "#,
        )
        .bind(&snapshot_json)
        .bind(outcome.status().as_str())
        .bind(&final_json)
        .bind(now)
        .bind(&completed_sections)
        .bind(session.id)
        .bind(&allowed_vec)
        .execute(&mut *tx)
        .await?;

        if flipped.rows_affected() == 0 {
            return Err(Error::Conflict(
                "Session was already finalized by a concurrent request".to_string(),
            ));
        }

        let result = sqlx::query_as::<_, SessionResult>(
            r#"
            INSERT INTO results (
                session_id, test_id, user_id, organization_id, attempt_number, outcome,
                question_results, earned_points, total_points, percentage, passed,
                correct_count, incorrect_count, unanswered_count
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING *
            "#,
        )
        .bind(session.id)
        .bind(session.test_id)
        .bind(session.user_id)
        .bind(session.organization_id)
        .bind(session.attempt_number)
        .bind(outcome.status().as_str())
        .bind(&results_json)
        .bind(final_score.earned_points)
        .bind(final_score.total_points)
        .bind(final_score.percentage)
        .bind(final_score.passed)
        .bind(final_score.correct_count)
        .bind(final_score.incorrect_count)
        .bind(final_score.unanswered_count)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO test_stats (test_id, attempts_count, pass_count, score_sum, recent_percentages, updated_at)
            VALUES ($1, 1, CASE WHEN $2 THEN 1 ELSE 0 END, $3, ARRAY[$3::float8], NOW())
            ON CONFLICT (test_id) DO UPDATE SET
                attempts_count = test_stats.attempts_count + 1,
                pass_count = test_stats.pass_count + CASE WHEN $2 THEN 1 ELSE 0 END,
                score_sum = test_stats.score_sum + $3,
                recent_percentages =
                    (array_append(test_stats.recent_percentages, $3::float8))
                    [GREATEST(COALESCE(array_length(test_stats.recent_percentages, 1), 0) + 2 - 20, 1):],
                updated_at = NOW()
            "#,
        )
        .bind(session.test_id)
        .bind(final_score.passed)
        .bind(final_score.percentage)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            session_id = %session.id,
            outcome = outcome.status().as_str(),
            percentage = final_score.percentage,
            passed = final_score.passed,
            "session finalized"
        );

        Ok((result, final_score))
    }

    /// Timer/sweeper path. If grading itself fails the session is marked
    /// expired directly so nothing can sit in_progress past its limit.
    pub async fn expire_session(&self, session_id: Uuid) -> Result<()> {
        match self
            .finalize_session(session_id, SessionOutcome::Expired, true)
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Conflict(_)) => Ok(()),
            Err(e) => {
                tracing::error!(%session_id, error = ?e, "auto-grade on expiry failed; marking expired directly");
                self.mark_terminal(session_id, SessionStatus::Expired).await
            }
        }
    }

    /// Same shape for abandonment (grace lapse, forced new session,
    /// explicit abandon, sweeper).
    pub async fn abandon_session(&self, session_id: Uuid) -> Result<()> {
        match self
            .finalize_session(session_id, SessionOutcome::Abandoned, true)
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Conflict(_)) => Ok(()),
            Err(e) => {
                tracing::error!(%session_id, error = ?e, "grading on abandon failed; marking abandoned directly");
                self.mark_terminal(session_id, SessionStatus::Abandoned)
                    .await
            }
        }
    }

    async fn mark_terminal(&self, session_id: Uuid, status: SessionStatus) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET status = $1, completed_at = NOW(), is_connected = FALSE,
                version = version + 1, updated_at = NOW()
            WHERE id = $2 AND status IN ('in_progress', 'paused')
            "#,
        )
        .bind(status.as_str())
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn grade_question(&self, q: &SnapshotQuestion) -> QuestionResult {
        let mut result = QuestionResult {
            question_id: q.question_id,
            question_type: q.payload.type_name().to_string(),
            prompt: q.prompt.clone(),
            student_answer: q.student_answer.clone(),
            correct_answer: None,
            is_correct: false,
            points_earned: 0.0,
            max_points: q.points,
            needs_review: false,
            unanswered: false,
        };

        if q.is_unanswered() {
            result.unanswered = true;
            return result;
        }
        let answer = q.student_answer.clone().unwrap_or(JsonValue::Null);

        match &q.payload {
            QuestionPayload::MultipleChoice(mc) => {
                result.correct_answer = Some(mc.correct_answer.clone());
                if Self::grade_choice(&answer, &mc.correct_answer) {
                    result.is_correct = true;
                    result.points_earned = q.points;
                }
            }
            QuestionPayload::TrueFalse(tf) => {
                result.correct_answer = Some(tf.correct_answer.clone());
                let given = Self::normalize_true_false(&answer);
                let expected = Self::normalize_true_false(&tf.correct_answer);
                if given.is_some() && given == expected {
                    result.is_correct = true;
                    result.points_earned = q.points;
                }
            }
            QuestionPayload::FillInBlank(fib) => {
                let (correct, total) = Self::grade_blanks(fib, &answer);
                result.points_earned = if total == 0 {
                    0.0
                } else {
                    Self::round2(correct as f64 / total as f64 * q.points)
                };
                result.is_correct = total > 0 && correct == total;
            }
            QuestionPayload::CodeChallenge(code) | QuestionPayload::Debugging(code) => {
                if q.category != Some(QuestionCategory::Logic) {
                    // UI/syntax code answers wait for manual review.
                    result.needs_review = true;
                    return result;
                }
                let request = SandboxRequest {
                    code: answer.as_str().unwrap_or_default().to_string(),
                    language: q.language.clone().unwrap_or_default(),
                    test_cases: code.test_cases.clone(),
                    runtime: code.runtime.clone().unwrap_or_default(),
                    entry_function: code.entry_function.clone().unwrap_or_default(),
                    timeout_ms: code.timeout_ms,
                };
                let outcome = self.sandbox.execute(&request).await;
                // All-or-nothing: every test case must pass.
                if outcome.success && outcome.overall_passed {
                    result.is_correct = true;
                    result.points_earned = q.points;
                }
            }
        }

        result
    }

    pub fn grade_choice(student: &JsonValue, correct: &JsonValue) -> bool {
        let given = Self::normalize_choice(student);
        let expected = Self::normalize_choice(correct);
        given != ChoiceValue::Missing && given == expected
    }

    /// Numeric strings are parsed to numbers, everything else is
    /// upper-cased, so "A", "a" and 1-style answers from different client
    /// versions compare consistently.
    pub fn normalize_choice(value: &JsonValue) -> ChoiceValue {
        match value {
            JsonValue::Null => ChoiceValue::Missing,
            JsonValue::Bool(b) => ChoiceValue::Text(b.to_string().to_uppercase()),
            JsonValue::Number(n) => n
                .as_f64()
                .map(ChoiceValue::Number)
                .unwrap_or(ChoiceValue::Missing),
            JsonValue::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    ChoiceValue::Missing
                } else if let Ok(n) = trimmed.parse::<f64>() {
                    ChoiceValue::Number(n)
                } else {
                    ChoiceValue::Text(trimmed.to_uppercase())
                }
            }
            JsonValue::Object(map) => map
                .get("selected")
                .map(Self::normalize_choice)
                .unwrap_or(ChoiceValue::Missing),
            JsonValue::Array(_) => ChoiceValue::Missing,
        }
    }

    /// Collapses every accepted true/false representation to the option
    /// index: 0 = True, 1 = False.
    pub fn normalize_true_false(value: &JsonValue) -> Option<i64> {
        match value {
            JsonValue::Bool(true) => Some(0),
            JsonValue::Bool(false) => Some(1),
            JsonValue::Number(n) => n.as_i64().filter(|i| *i == 0 || *i == 1),
            JsonValue::String(s) => match s.trim().to_lowercase().as_str() {
                "true" => Some(0),
                "false" => Some(1),
                "0" => Some(0),
                "1" => Some(1),
                _ => None,
            },
            JsonValue::Object(map) => map.get("selected").and_then(Self::normalize_true_false),
            _ => None,
        }
    }

    /// Returns (blanks correct, blanks total). Accepts an array of blank
    /// values or an object keyed by blank index.
    pub fn grade_blanks(payload: &FillInBlankPayload, answer: &JsonValue) -> (usize, usize) {
        let total = payload.blanks.len();
        let mut correct = 0;
        for (i, blank) in payload.blanks.iter().enumerate() {
            let given = match answer {
                JsonValue::Array(items) => items.get(i).cloned(),
                JsonValue::Object(map) => map.get(&i.to_string()).cloned(),
                JsonValue::String(_) if total == 1 && i == 0 => Some(answer.clone()),
                _ => None,
            };
            let Some(JsonValue::String(text)) = given else {
                continue;
            };
            let text = text.trim();
            let matched = blank.accepted_answers.iter().any(|accepted| {
                if blank.case_sensitive {
                    accepted.trim() == text
                } else {
                    accepted.trim().eq_ignore_ascii_case(text)
                }
            });
            if matched {
                correct += 1;
            }
        }
        (correct, total)
    }

    pub fn score(results: &[QuestionResult], passing_threshold: f64) -> FinalScore {
        let total_points: f64 = results.iter().map(|r| r.max_points).sum();
        let earned_points: f64 = results.iter().map(|r| r.points_earned).sum();
        let mut correct_count = 0;
        let mut incorrect_count = 0;
        let mut unanswered_count = 0;
        for r in results {
            if r.unanswered {
                unanswered_count += 1;
            } else if r.is_correct {
                correct_count += 1;
            } else {
                incorrect_count += 1;
            }
        }
        let percentage = if total_points > 0.0 {
            Self::round2(earned_points / total_points * 100.0)
        } else {
            0.0
        };
        FinalScore {
            earned_points,
            total_points,
            percentage,
            passed: percentage >= passing_threshold,
            correct_count,
            incorrect_count,
            unanswered_count,
        }
    }

    pub fn round2(value: f64) -> f64 {
        (value * 100.0).round() / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::snapshot::FillBlank;
    use serde_json::json;

    #[test]
    fn choice_normalization_matches_across_client_shapes() {
        // "A" and "a" compare equal; "1" and 1 compare equal.
        assert!(GradingService::grade_choice(&json!("a"), &json!("A")));
        assert!(GradingService::grade_choice(&json!("1"), &json!(1)));
        assert!(GradingService::grade_choice(&json!(2), &json!("2")));
        assert!(GradingService::grade_choice(
            &json!({"selected": 3}),
            &json!(3)
        ));
        assert!(!GradingService::grade_choice(&json!("b"), &json!("A")));
        assert!(!GradingService::grade_choice(&json!(null), &json!(null)));
        assert!(!GradingService::grade_choice(&json!(""), &json!("A")));
    }

    #[test]
    fn true_false_representations_collapse_to_option_index() {
        assert_eq!(GradingService::normalize_true_false(&json!(true)), Some(0));
        assert_eq!(GradingService::normalize_true_false(&json!(false)), Some(1));
        assert_eq!(GradingService::normalize_true_false(&json!("True")), Some(0));
        assert_eq!(GradingService::normalize_true_false(&json!("false")), Some(1));
        assert_eq!(GradingService::normalize_true_false(&json!(0)), Some(0));
        assert_eq!(GradingService::normalize_true_false(&json!(1)), Some(1));
        assert_eq!(GradingService::normalize_true_false(&json!(2)), None);
        assert_eq!(GradingService::normalize_true_false(&json!("maybe")), None);
    }

    fn blanks(n: usize) -> FillInBlankPayload {
        FillInBlankPayload {
            template: "The ___ sat on the ___".into(),
            blanks: (0..n)
                .map(|i| FillBlank {
                    accepted_answers: vec![format!("word{}", i), format!("alt{}", i)],
                    case_sensitive: false,
                })
                .collect(),
        }
    }

    #[test]
    fn blank_grading_gives_partial_credit_fractions() {
        let payload = blanks(4);
        let answer = json!(["word0", "wrong", "ALT2", "word3"]);
        assert_eq!(GradingService::grade_blanks(&payload, &answer), (3, 4));
    }

    #[test]
    fn blank_grading_accepts_object_keyed_answers() {
        let payload = blanks(2);
        let answer = json!({"0": "word0", "1": "nope"});
        assert_eq!(GradingService::grade_blanks(&payload, &answer), (1, 2));
    }

    #[test]
    fn single_blank_accepts_bare_string_answer() {
        let payload = blanks(1);
        assert_eq!(
            GradingService::grade_blanks(&payload, &json!("Word0")),
            (1, 1)
        );
    }

    #[test]
    fn case_sensitive_blank_rejects_wrong_case() {
        let mut payload = blanks(1);
        payload.blanks[0].case_sensitive = true;
        assert_eq!(
            GradingService::grade_blanks(&payload, &json!("WORD0")),
            (0, 1)
        );
    }

    #[test]
    fn partial_credit_rounds_to_two_decimals() {
        // 1 of 3 blanks on a 1-point question: 0.33, not 0.3333...
        assert_eq!(GradingService::round2(1.0 / 3.0), 0.33);
        assert_eq!(GradingService::round2(2.0 / 3.0 * 100.0), 66.67);
    }

    fn result(points_earned: f64, max: f64, correct: bool, unanswered: bool) -> QuestionResult {
        QuestionResult {
            question_id: 1,
            question_type: "multiple_choice".into(),
            prompt: "q".into(),
            student_answer: None,
            correct_answer: None,
            is_correct: correct,
            points_earned,
            max_points: max,
            needs_review: false,
            unanswered,
        }
    }

    #[test]
    fn one_of_two_points_scores_fifty_percent_and_fails() {
        let results = vec![
            result(1.0, 1.0, true, false),
            result(0.0, 1.0, false, false),
        ];
        let score = GradingService::score(&results, 70.0);
        assert_eq!(score.earned_points, 1.0);
        assert_eq!(score.total_points, 2.0);
        assert_eq!(score.percentage, 50.0);
        assert!(!score.passed);
        assert_eq!(score.correct_count, 1);
        assert_eq!(score.incorrect_count, 1);
    }

    #[test]
    fn unanswered_questions_count_separately_and_score_zero() {
        let results = vec![result(1.0, 1.0, true, false), result(0.0, 1.0, false, true)];
        let score = GradingService::score(&results, 50.0);
        assert_eq!(score.unanswered_count, 1);
        assert_eq!(score.incorrect_count, 0);
        assert_eq!(score.percentage, 50.0);
        assert!(score.passed);
    }

    #[test]
    fn empty_test_scores_zero_percent() {
        let score = GradingService::score(&[], 70.0);
        assert_eq!(score.percentage, 0.0);
        assert!(!score.passed);
    }

    #[test]
    fn passing_is_inclusive_of_the_threshold() {
        let results = vec![result(7.0, 10.0, true, false)];
        let score = GradingService::score(&results, 70.0);
        assert_eq!(score.percentage, 70.0);
        assert!(score.passed);
    }
}
