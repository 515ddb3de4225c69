use crate::dto::session_dto::{
    AnswerOutcome, CurrentQuestionResponse, SanitizedQuestion, SectionSummaryResponse,
    SkipQuestionRequest, SubmitAnswerRequest, SubmitSectionResponse,
};
use crate::error::{Error, Result};
use crate::middleware::auth::AuthContext;
use crate::models::session::{Session, SessionStatus};
use crate::models::snapshot::{QuestionStatus, SectionStatus, TestSnapshot};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use uuid::Uuid;

/// Result of a timer-driven forced section submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForcedSectionOutcome {
    Advanced {
        section_index: i32,
        remaining_seconds: i64,
    },
    TestComplete,
}

enum AnswerAction {
    Answer { value: JsonValue, time_spent: i64 },
    Skip { time_spent: i64 },
}

/// Section-relative navigation and answer-submission state machine. Every
/// mutation goes through a version CAS; a lost CAS surfaces as Conflict.
#[derive(Clone)]
pub struct NavigatorService {
    pool: PgPool,
}

impl NavigatorService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_current_question(
        &self,
        session_id: Uuid,
        auth: &AuthContext,
    ) -> Result<CurrentQuestionResponse> {
        let session = self.load_owned(session_id, auth.user_id).await?;
        Self::ensure_active(&session)?;
        let mut snapshot = session.snapshot()?;
        let now = Utc::now();

        let sec = session.current_section_index as usize;
        let qi = session.current_question_index as usize;
        {
            let q = snapshot
                .question_at_mut(sec, qi)
                .ok_or_else(|| Error::Internal("Navigation cursor out of range".to_string()))?;
            if q.status == QuestionStatus::NotViewed {
                q.status = QuestionStatus::Viewed;
                q.first_viewed_at = Some(now);
            }
            q.view_count += 1;
            q.last_viewed_at = Some(now);
        }

        let saved = self.persist(&session, &snapshot).await?;
        Self::current_question_response(&saved, &snapshot, now)
    }

    /// Persists the answer and advances. A question_index that does not
    /// match the server cursor means the previous response was lost in
    /// transit; the current state is returned idempotently instead of
    /// re-applying the answer.
    pub async fn submit_answer(
        &self,
        session_id: Uuid,
        auth: &AuthContext,
        req: SubmitAnswerRequest,
    ) -> Result<AnswerOutcome> {
        self.record_and_advance(
            session_id,
            auth,
            req.question_index,
            AnswerAction::Answer {
                value: req.answer,
                time_spent: req.time_spent_seconds,
            },
        )
        .await
    }

    /// Marks the current question skipped (clearing any answer) and
    /// advances exactly like submit, without requiring an answer.
    pub async fn skip_question(
        &self,
        session_id: Uuid,
        auth: &AuthContext,
        req: SkipQuestionRequest,
    ) -> Result<AnswerOutcome> {
        self.record_and_advance(
            session_id,
            auth,
            req.question_index,
            AnswerAction::Skip {
                time_spent: req.time_spent_seconds,
            },
        )
        .await
    }

    pub async fn navigate_to(
        &self,
        session_id: Uuid,
        auth: &AuthContext,
        question_index: i32,
    ) -> Result<CurrentQuestionResponse> {
        let mut session = self.load_owned(session_id, auth.user_id).await?;
        Self::ensure_active(&session)?;
        let mut snapshot = session.snapshot()?;
        let now = Utc::now();

        let sec = session.current_section_index as usize;
        let count = snapshot.questions_in(sec).len();
        if question_index < 0 || question_index as usize >= count {
            return Err(Error::NotFound(format!(
                "No question at index {} in the current section",
                question_index
            )));
        }

        session.current_question_index = question_index;
        {
            let q = snapshot
                .question_at_mut(sec, question_index as usize)
                .ok_or_else(|| Error::Internal("Navigation cursor out of range".to_string()))?;
            if q.status == QuestionStatus::NotViewed {
                q.status = QuestionStatus::Viewed;
                q.first_viewed_at = Some(now);
            }
            q.view_count += 1;
            q.last_viewed_at = Some(now);
        }

        let saved = self.persist(&session, &snapshot).await?;
        Self::current_question_response(&saved, &snapshot, now)
    }

    /// Explicit entry into review mode, without the last-question trigger.
    pub async fn start_section_review(
        &self,
        session_id: Uuid,
        auth: &AuthContext,
    ) -> Result<SectionSummaryResponse> {
        let mut session = self.load_owned(session_id, auth.user_id).await?;
        Self::ensure_active(&session)?;
        let mut snapshot = session.snapshot()?;
        if !snapshot.settings.use_sections {
            return Err(Error::InvalidState(
                "Test has no sections to review".to_string(),
            ));
        }
        let sec = session.current_section_index as usize;
        let section = snapshot
            .section_mut(sec)
            .ok_or_else(|| Error::Internal("Section cursor out of range".to_string()))?;
        if !matches!(
            section.status,
            SectionStatus::InProgress | SectionStatus::Reviewing
        ) {
            return Err(Error::InvalidState(
                "Section cannot enter review from its current state".to_string(),
            ));
        }
        section.status = SectionStatus::Reviewing;
        session.review_phase = true;

        let saved = self.persist(&session, &snapshot).await?;
        Self::section_summary(&saved, &snapshot, Utc::now())
    }

    pub async fn submit_section(
        &self,
        session_id: Uuid,
        auth: &AuthContext,
    ) -> Result<SubmitSectionResponse> {
        let session = self.load_owned(session_id, auth.user_id).await?;
        self.submit_section_inner(session, false).await
    }

    /// Timer path: submits the active section when its budget lapses,
    /// regardless of review state.
    pub async fn force_submit_section(&self, session_id: Uuid) -> Result<ForcedSectionOutcome> {
        let session = self.load(session_id).await?;
        let resp = self.submit_section_inner(session, true).await?;
        Ok(if resp.test_complete {
            ForcedSectionOutcome::TestComplete
        } else {
            ForcedSectionOutcome::Advanced {
                section_index: resp.advanced_to_section.unwrap_or_default(),
                remaining_seconds: resp.time_remaining_seconds.unwrap_or_default(),
            }
        })
    }

    async fn submit_section_inner(
        &self,
        session: Session,
        force: bool,
    ) -> Result<SubmitSectionResponse> {
        Self::ensure_active(&session)?;
        let mut snapshot = session.snapshot()?;
        if !snapshot.settings.use_sections {
            return Err(Error::InvalidState("Test has no sections".to_string()));
        }

        let sec = session.current_section_index as usize;
        let section_count = snapshot.sections.len();
        let now = Utc::now();
        {
            let section = snapshot
                .section_mut(sec)
                .ok_or_else(|| Error::Internal("Section cursor out of range".to_string()))?;
            if !force
                && !matches!(
                    section.status,
                    SectionStatus::InProgress | SectionStatus::Reviewing
                )
            {
                return Err(Error::InvalidState(
                    "Section is not open for submission".to_string(),
                ));
            }
            section.status = SectionStatus::Submitted;
            section.submitted_at = Some(now);
        }

        let is_last = sec + 1 >= section_count;
        if !is_last {
            let next = snapshot
                .section_mut(sec + 1)
                .ok_or_else(|| Error::Internal("Section cursor out of range".to_string()))?;
            next.status = SectionStatus::InProgress;
            next.started_at = Some(now);
        }

        let snapshot_json = serde_json::to_value(&snapshot)?;
        let next_index = if is_last { sec as i32 } else { (sec + 1) as i32 };

        // Atomic conditional advance: only applies while the cursor still
        // points at the section that was read. A racing duplicate request
        // matches no row and is told the section already advanced.
        let updated = sqlx::query_as::<_, Session>(
            r#"
            UPDATE sessions
            SET snapshot = $1, current_section_index = $2, current_question_index = 0,
                review_phase = FALSE,
                completed_sections = array_append(completed_sections, $3),
                version = version + 1, updated_at = NOW()
            WHERE id = $4 AND status = 'in_progress'
              AND current_section_index = $3
              AND NOT (completed_sections @> ARRAY[$3::int4])
            RETURNING *
            "#,
        )
        .bind(&snapshot_json)
        .bind(next_index)
        .bind(sec as i32)
        .bind(session.id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(saved) = updated else {
            return Err(Error::Conflict(
                "Section was already submitted".to_string(),
            ));
        };

        tracing::info!(
            session_id = %saved.id,
            section = sec,
            test_complete = is_last,
            forced = force,
            "section submitted"
        );

        Ok(SubmitSectionResponse {
            submitted_section_index: sec as i32,
            advanced_to_section: if is_last { None } else { Some(next_index) },
            test_complete: is_last,
            time_remaining_seconds: if is_last {
                None
            } else {
                saved.section_remaining_seconds(&snapshot, now)
            },
        })
    }

    async fn record_and_advance(
        &self,
        session_id: Uuid,
        auth: &AuthContext,
        question_index: i32,
        action: AnswerAction,
    ) -> Result<AnswerOutcome> {
        let mut session = self.load_owned(session_id, auth.user_id).await?;
        Self::ensure_active(&session)?;
        let mut snapshot = session.snapshot()?;
        let now = Utc::now();

        if question_index != session.current_question_index {
            tracing::info!(
                session_id = %session.id,
                client_index = question_index,
                server_index = session.current_question_index,
                "answer index mismatch; replaying authoritative state"
            );
            let current = Self::current_question_response(&session, &snapshot, now)?;
            return Ok(AnswerOutcome::AlreadyProcessed {
                current: Box::new(current),
            });
        }

        let sec = session.current_section_index as usize;
        let qi = session.current_question_index as usize;
        let count = snapshot.questions_in(sec).len();
        {
            let q = snapshot
                .question_at_mut(sec, qi)
                .ok_or_else(|| Error::Internal("Navigation cursor out of range".to_string()))?;
            match action {
                AnswerAction::Answer { value, time_spent } => {
                    q.student_answer = Some(value);
                    q.status = QuestionStatus::Answered;
                    q.time_spent_seconds += time_spent.max(0);
                }
                AnswerAction::Skip { time_spent } => {
                    q.student_answer = None;
                    q.status = QuestionStatus::Skipped;
                    q.time_spent_seconds += time_spent.max(0);
                }
            }
            q.last_viewed_at = Some(now);
        }

        if session.review_phase {
            self.persist(&session, &snapshot).await?;
            return Ok(AnswerOutcome::SavedInReview { question_index });
        }

        if qi + 1 < count {
            session.current_question_index += 1;
            {
                let next = snapshot
                    .question_at_mut(sec, qi + 1)
                    .ok_or_else(|| Error::Internal("Navigation cursor out of range".to_string()))?;
                if next.status == QuestionStatus::NotViewed {
                    next.status = QuestionStatus::Viewed;
                    next.first_viewed_at = Some(now);
                }
                next.view_count += 1;
                next.last_viewed_at = Some(now);
            }
            let saved = self.persist(&session, &snapshot).await?;
            let next = Self::current_question_response(&saved, &snapshot, now)?;
            return Ok(AnswerOutcome::Advanced {
                next: Box::new(next),
            });
        }

        if snapshot.settings.use_sections {
            // Last question of the section: hand the student to review.
            {
                let section = snapshot
                    .section_mut(sec)
                    .ok_or_else(|| Error::Internal("Section cursor out of range".to_string()))?;
                section.status = SectionStatus::Reviewing;
            }
            session.review_phase = true;
            let saved = self.persist(&session, &snapshot).await?;
            let summary = Self::section_summary(&saved, &snapshot, now)?;
            return Ok(AnswerOutcome::SectionReview { summary });
        }

        // Last question of a flat test.
        let unanswered: Vec<i32> = snapshot
            .questions_in(0)
            .iter()
            .enumerate()
            .filter(|(_, q)| q.status != QuestionStatus::Answered)
            .map(|(i, _)| i as i32)
            .collect();
        self.persist(&session, &snapshot).await?;
        Ok(if unanswered.is_empty() {
            AnswerOutcome::ReadyToSubmit
        } else {
            AnswerOutcome::ConfirmSubmit {
                unanswered_indices: unanswered,
            }
        })
    }

    async fn load(&self, session_id: Uuid) -> Result<Session> {
        sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound("Session not found".to_string()))
    }

    async fn load_owned(&self, session_id: Uuid, user_id: Uuid) -> Result<Session> {
        let session = self.load(session_id).await?;
        if session.user_id != user_id {
            return Err(Error::Forbidden(
                "Session belongs to a different student".to_string(),
            ));
        }
        Ok(session)
    }

    fn ensure_active(session: &Session) -> Result<()> {
        match session.status() {
            SessionStatus::InProgress => Ok(()),
            SessionStatus::Paused => Err(Error::InvalidState(
                "Session is paused; reconnect to continue".to_string(),
            )),
            other => Err(Error::InvalidState(format!(
                "Session is {}",
                other.as_str()
            ))),
        }
    }

    /// Version CAS write. The snapshot and cursor go out together; losing
    /// the race means another request mutated the session first.
    async fn persist(&self, session: &Session, snapshot: &TestSnapshot) -> Result<Session> {
        let snapshot_json = serde_json::to_value(snapshot)?;
        let updated = sqlx::query_as::<_, Session>(
            r#"
            UPDATE sessions
            SET snapshot = $1, current_section_index = $2, current_question_index = $3,
                review_phase = $4, version = version + 1, updated_at = NOW()
            WHERE id = $5 AND version = $6
            RETURNING *
            "#,
        )
        .bind(&snapshot_json)
        .bind(session.current_section_index)
        .bind(session.current_question_index)
        .bind(session.review_phase)
        .bind(session.id)
        .bind(session.version)
        .fetch_optional(&self.pool)
        .await?;
        updated.ok_or_else(|| {
            Error::Conflict("Session was modified by a concurrent request".to_string())
        })
    }

    fn current_question_response(
        session: &Session,
        snapshot: &TestSnapshot,
        now: DateTime<Utc>,
    ) -> Result<CurrentQuestionResponse> {
        let sec = session.current_section_index as usize;
        let qi = session.current_question_index as usize;
        let q = snapshot
            .question_at(sec, qi)
            .ok_or_else(|| Error::Internal("Navigation cursor out of range".to_string()))?;
        Ok(CurrentQuestionResponse {
            question: SanitizedQuestion::from_snapshot(q),
            section_index: session.current_section_index,
            question_index: session.current_question_index,
            section_name: if snapshot.settings.use_sections {
                snapshot.section(sec).map(|s| s.name.clone())
            } else {
                None
            },
            section_question_count: snapshot.questions_in(sec).len(),
            review_phase: session.review_phase,
            time_remaining_seconds: session.overall_remaining_seconds(now),
            section_time_remaining_seconds: session.section_remaining_seconds(snapshot, now),
        })
    }

    fn section_summary(
        session: &Session,
        snapshot: &TestSnapshot,
        now: DateTime<Utc>,
    ) -> Result<SectionSummaryResponse> {
        let sec = session.current_section_index as usize;
        let section = snapshot
            .section(sec)
            .ok_or_else(|| Error::Internal("Section cursor out of range".to_string()))?;
        let mut answered = 0;
        let mut skipped = 0;
        let mut unanswered_indices = Vec::new();
        for (i, q) in section.questions.iter().enumerate() {
            match q.status {
                QuestionStatus::Answered => answered += 1,
                QuestionStatus::Skipped => {
                    skipped += 1;
                    unanswered_indices.push(i as i32);
                }
                _ => unanswered_indices.push(i as i32),
            }
        }
        Ok(SectionSummaryResponse {
            section_index: sec as i32,
            name: section.name.clone(),
            question_count: section.questions.len(),
            answered,
            skipped,
            unanswered_indices,
            time_remaining_seconds: session.section_remaining_seconds(snapshot, now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::snapshot::{
        SnapshotQuestion, SnapshotSection, SnapshotSettings, TrueFalsePayload,
    };
    use chrono::Duration;
    use serde_json::json;

    fn question(id: i32, status: QuestionStatus) -> SnapshotQuestion {
        SnapshotQuestion {
            question_id: id,
            prompt: format!("q{}", id),
            language: None,
            difficulty: None,
            category: None,
            points: 1.0,
            final_order: id,
            payload: crate::models::snapshot::QuestionPayload::TrueFalse(TrueFalsePayload {
                correct_answer: json!(0),
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

    fn snapshot_with_section(statuses: &[QuestionStatus]) -> TestSnapshot {
        TestSnapshot {
            title: "t".into(),
            description: None,
            settings: SnapshotSettings {
                time_limit_minutes: 60,
                attempts_allowed: 1,
                shuffle_questions: false,
                use_sections: true,
                passing_score: 70.0,
            },
            shuffle_seed: "00".into(),
            sections: vec![SnapshotSection {
                name: "A".into(),
                time_limit_minutes: 10,
                status: SectionStatus::InProgress,
                started_at: Some(Utc::now()),
                submitted_at: None,
                questions: statuses
                    .iter()
                    .enumerate()
                    .map(|(i, s)| question(i as i32 + 1, *s))
                    .collect(),
            }],
            questions: vec![],
        }
    }

    fn session_at(section: i32, question: i32) -> Session {
        let now = Utc::now();
        Session {
            id: Uuid::new_v4(),
            test_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            attempt_number: 1,
            status: "in_progress".into(),
            snapshot: json!({}),
            current_section_index: section,
            current_question_index: question,
            completed_sections: vec![],
            review_phase: false,
            is_connected: true,
            disconnected_at: None,
            last_connected_at: None,
            grace_expired: false,
            started_at: now,
            expires_at: now + Duration::minutes(60),
            paused_at: None,
            time_remaining_at_pause_secs: None,
            completed_at: None,
            final_score: None,
            version: 0,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn cursor_outside_section_bounds_is_an_internal_error() {
        let snapshot = snapshot_with_section(&[
            QuestionStatus::Viewed,
            QuestionStatus::NotViewed,
        ]);
        let session = session_at(0, 5);
        let err = NavigatorService::current_question_response(&session, &snapshot, Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn current_question_response_is_section_relative() {
        let snapshot = snapshot_with_section(&[
            QuestionStatus::Answered,
            QuestionStatus::Viewed,
            QuestionStatus::NotViewed,
        ]);
        let session = session_at(0, 1);
        let resp =
            NavigatorService::current_question_response(&session, &snapshot, Utc::now()).unwrap();
        assert_eq!(resp.question.question_id, 2);
        assert_eq!(resp.section_question_count, 3);
        assert_eq!(resp.section_name.as_deref(), Some("A"));
    }

    #[test]
    fn section_summary_counts_by_status() {
        let snapshot = snapshot_with_section(&[
            QuestionStatus::Answered,
            QuestionStatus::Skipped,
            QuestionStatus::Viewed,
            QuestionStatus::Answered,
        ]);
        let session = session_at(0, 3);
        let summary = NavigatorService::section_summary(&session, &snapshot, Utc::now()).unwrap();
        assert_eq!(summary.answered, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.unanswered_indices, vec![1, 2]);
    }

    #[test]
    fn paused_sessions_reject_navigation() {
        let mut session = session_at(0, 0);
        session.status = "paused".into();
        let err = NavigatorService::ensure_active(&session).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }
}
