use crate::dto::session_dto::TimeSyncResponse;
use crate::error::{Error, Result};
use crate::middleware::auth::AuthContext;
use crate::models::session::{Session, SessionStatus};
use crate::models::snapshot::{SectionStatus, TestSnapshot};
use crate::models::student_test_override::StudentTestOverride;
use crate::models::test_definition::TestRow;
use crate::services::grading_service::GradingService;
use crate::services::sandbox_service::SandboxService;
use crate::services::snapshot_service::SnapshotBuilder;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

pub struct RejoinCheck {
    pub session: Session,
    pub snapshot: TestSnapshot,
    pub recovered: bool,
}

/// Orchestrates create/rejoin/abandon/inspect, owns permission and
/// attempt-limit checks, and recovers corrupted sessions.
#[derive(Clone)]
pub struct SessionService {
    pool: PgPool,
}

impl SessionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn grading(&self) -> GradingService {
        GradingService::new(self.pool.clone(), SandboxService::from_config())
    }

    /// Finds the user's live session, recovering it if the embedded
    /// snapshot is corrupt. Recovery failure marks the session failed,
    /// which never consumes an attempt.
    pub async fn check_rejoin(&self, auth: &AuthContext) -> Result<Option<RejoinCheck>> {
        let found = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE user_id = $1 AND status IN ('in_progress', 'paused') LIMIT 1",
        )
        .bind(auth.user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(session) = found else {
            return Ok(None);
        };

        if session.expires_at <= Utc::now() {
            self.grading().expire_session(session.id).await?;
            return Ok(None);
        }

        match session.snapshot() {
            Ok(snapshot) => Ok(Some(RejoinCheck {
                session,
                snapshot,
                recovered: false,
            })),
            Err(parse_err) => {
                tracing::warn!(
                    session_id = %session.id,
                    error = %parse_err,
                    "session snapshot is corrupt; attempting recovery"
                );
                match self.recover_session(&session).await {
                    Ok(recovered) => {
                        let snapshot = recovered.snapshot()?;
                        Ok(Some(RejoinCheck {
                            session: recovered,
                            snapshot,
                            recovered: true,
                        }))
                    }
                    Err(e) => {
                        tracing::error!(session_id = %session.id, error = ?e, "session recovery failed");
                        self.mark_failed(session.id).await?;
                        Err(Error::RecoveryFailure(
                            "Your previous session could not be restored. No attempt was consumed."
                                .to_string(),
                        ))
                    }
                }
            }
        }
    }

    /// Creates a new attempt. Returns the session and, when force_new
    /// replaced a live session, the id of the abandoned one so the caller
    /// can cancel its timers.
    pub async fn create_session(
        &self,
        auth: &AuthContext,
        test_id: Uuid,
        force_new: bool,
    ) -> Result<(Session, TestSnapshot, Option<Uuid>)> {
        if !auth.is_student() {
            return Err(Error::Forbidden(
                "Only students can start a test session".to_string(),
            ));
        }

        let existing = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE user_id = $1 AND status IN ('in_progress', 'paused') LIMIT 1",
        )
        .bind(auth.user_id)
        .fetch_optional(&self.pool)
        .await?;

        let mut abandoned_old = None;
        if let Some(old) = existing {
            if !force_new {
                return Err(Error::Conflict(
                    "An active session already exists; rejoin it or pass force_new".to_string(),
                ));
            }
            self.grading().abandon_session(old.id).await?;
            abandoned_old = Some(old.id);
        }

        let test = sqlx::query_as::<_, TestRow>("SELECT * FROM tests WHERE id = $1")
            .bind(test_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound("Test not found".to_string()))?;

        if !test.is_active() {
            return Err(Error::InvalidState("Test is not active".to_string()));
        }
        if !test.is_global && test.organization_id != auth.organization_id {
            return Err(Error::Forbidden(
                "Test belongs to a different organization".to_string(),
            ));
        }

        let settings = test.settings()?;
        if settings.time_limit_minutes <= 0 {
            return Err(Error::Validation(
                "Test time limit must be a positive number".to_string(),
            ));
        }
        if settings.use_sections {
            for section in test.definition_sections()? {
                if section.time_limit_minutes <= 0 {
                    return Err(Error::Validation(format!(
                        "Section '{}' time limit must be a positive number",
                        section.name
                    )));
                }
            }
        }

        if !auth.unlimited_attempts {
            let used: i64 = sqlx::query_scalar(
                r#"SELECT COUNT(*) FROM sessions
                   WHERE user_id = $1 AND test_id = $2
                     AND status IN ('completed', 'abandoned', 'expired')"#,
            )
            .bind(auth.user_id)
            .bind(test_id)
            .fetch_one(&self.pool)
            .await?;

            let override_row = sqlx::query_as::<_, StudentTestOverride>(
                "SELECT * FROM student_test_overrides WHERE user_id = $1 AND test_id = $2",
            )
            .bind(auth.user_id)
            .bind(test_id)
            .fetch_optional(&self.pool)
            .await?;
            let extra = override_row.map(|o| o.extra_attempts).unwrap_or(0);

            let allowed = settings.attempts_allowed as i64 + extra as i64;
            if used >= allowed {
                return Err(Error::Forbidden(format!(
                    "Attempt limit reached ({} of {})",
                    used, allowed
                )));
            }
        }

        // Max-seen + 1, tolerant of gaps left by failed sessions, so the
        // unique (user, test, attempt_number) key never collides.
        let attempt_number: i32 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(attempt_number), 0) + 1 FROM sessions WHERE user_id = $1 AND test_id = $2",
        )
        .bind(auth.user_id)
        .bind(test_id)
        .fetch_one(&self.pool)
        .await?;

        let mut snapshot = SnapshotBuilder::build(&test, auth.user_id)?;
        let now = Utc::now();
        if snapshot.settings.use_sections {
            if let Some(first) = snapshot.section_mut(0) {
                first.status = SectionStatus::InProgress;
                first.started_at = Some(now);
            }
        }
        let expires_at = now + Duration::minutes(settings.time_limit_minutes);
        let snapshot_json = serde_json::to_value(&snapshot)?;

        let session = sqlx::query_as::<_, Session>(
            r#"
            INSERT INTO sessions (
                test_id, user_id, organization_id, attempt_number, snapshot,
                started_at, expires_at, last_connected_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $6)
            RETURNING *
            "#,
        )
        .bind(test_id)
        .bind(auth.user_id)
        .bind(auth.organization_id)
        .bind(attempt_number)
        .bind(&snapshot_json)
        .bind(now)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.code().as_deref() == Some("23505") {
                    return Error::Conflict(
                        "An active session already exists for this student".to_string(),
                    );
                }
            }
            Error::from(e)
        })?;

        tracing::info!(
            session_id = %session.id,
            user_id = %auth.user_id,
            test_id = %test_id,
            attempt = attempt_number,
            "session created"
        );

        Ok((session, snapshot, abandoned_old))
    }

    /// Rejoining an already-expired session flips it to expired and
    /// raises instead of resuming.
    pub async fn rejoin_session(&self, session_id: Uuid, auth: &AuthContext) -> Result<Session> {
        let session = self.load_owned(session_id, auth.user_id).await?;
        if !session.status().is_live() {
            return Err(Error::InvalidState(format!(
                "Session is {} and cannot be rejoined",
                session.status
            )));
        }
        if session.expires_at <= Utc::now() {
            self.grading().expire_session(session_id).await?;
            return Err(Error::InvalidState("Session has expired".to_string()));
        }
        self.resume_connected(session_id).await
    }

    pub async fn abandon_session(&self, session_id: Uuid, auth: &AuthContext) -> Result<()> {
        let session = self.load_owned(session_id, auth.user_id).await?;
        if !session.status().is_live() {
            return Err(Error::InvalidState(format!(
                "Session is {} and cannot be abandoned",
                session.status
            )));
        }
        self.grading().abandon_session(session_id).await
    }

    /// Students see only their own sessions.
    pub async fn get_session(&self, session_id: Uuid, auth: &AuthContext) -> Result<Session> {
        self.load_owned(session_id, auth.user_id).await
    }

    /// Instructors/admins see full detail, scoped to their organization
    /// unless super-admin.
    pub async fn get_session_for_admin(
        &self,
        session_id: Uuid,
        auth: &AuthContext,
    ) -> Result<Session> {
        let session = self.load(session_id).await?;
        if !auth.is_super_org_admin && session.organization_id != auth.organization_id {
            return Err(Error::Forbidden(
                "Session belongs to a different organization".to_string(),
            ));
        }
        Ok(session)
    }

    /// Connectivity ping. A paused session resumes here (the HTTP
    /// fallback when no realtime channel exists); the deadline never
    /// moved, so time spent disconnected has already been charged.
    pub async fn heartbeat(&self, session_id: Uuid, auth: &AuthContext) -> Result<(Session, bool)> {
        let session = self.load_owned(session_id, auth.user_id).await?;
        match session.status() {
            SessionStatus::InProgress => {
                let updated = sqlx::query_as::<_, Session>(
                    r#"
                    UPDATE sessions
                    SET is_connected = TRUE, last_connected_at = NOW(), updated_at = NOW()
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;
                Ok((updated, false))
            }
            SessionStatus::Paused => {
                if session.expires_at <= Utc::now() {
                    self.grading().expire_session(session_id).await?;
                    return Err(Error::InvalidState("Session has expired".to_string()));
                }
                let resumed = self.resume_connected(session_id).await?;
                Ok((resumed, true))
            }
            other => Err(Error::InvalidState(format!(
                "Session is {}",
                other.as_str()
            ))),
        }
    }

    /// Wall-clock-independent remaining time, derived from the session's
    /// own timer math, never from client-reported time.
    pub async fn time_sync(&self, session_id: Uuid, auth: &AuthContext) -> Result<TimeSyncResponse> {
        self.load_owned(session_id, auth.user_id).await?;
        self.time_sync_system(session_id).await
    }

    pub async fn time_sync_system(&self, session_id: Uuid) -> Result<TimeSyncResponse> {
        let session = self.load(session_id).await?;
        let now = Utc::now();
        let section_remaining = session
            .snapshot()
            .ok()
            .and_then(|snapshot| session.section_remaining_seconds(&snapshot, now));
        Ok(TimeSyncResponse {
            session_id: session.id,
            status: session.status.clone(),
            time_remaining_seconds: session.overall_remaining_seconds(now),
            section_time_remaining_seconds: section_remaining,
            server_time: now,
        })
    }

    /// Called by the realtime transport when the student's socket drops.
    /// Pauses bookkeeping and freezes the displayed remaining time; the
    /// grace timer is the caller's responsibility.
    pub async fn mark_disconnected(&self, session_id: Uuid, auth: &AuthContext) -> Result<Session> {
        let session = self.load_owned(session_id, auth.user_id).await?;
        match session.status() {
            SessionStatus::Paused => Ok(session),
            SessionStatus::InProgress => {
                let now = Utc::now();
                let frozen = session
                    .snapshot()
                    .ok()
                    .and_then(|snapshot| session.section_remaining_seconds(&snapshot, now))
                    .unwrap_or_else(|| session.overall_remaining_seconds(now));
                let updated = sqlx::query_as::<_, Session>(
                    r#"
                    UPDATE sessions
                    SET status = 'paused', is_connected = FALSE, disconnected_at = $1,
                        paused_at = $1, time_remaining_at_pause_secs = $2,
                        version = version + 1, updated_at = NOW()
                    WHERE id = $3 AND status = 'in_progress'
                    RETURNING *
                    "#,
                )
                .bind(now)
                .bind(frozen)
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;
                match updated {
                    Some(s) => Ok(s),
                    // A concurrent transition won; report current state.
                    None => self.load(session_id).await,
                }
            }
            other => Err(Error::InvalidState(format!(
                "Session is {}",
                other.as_str()
            ))),
        }
    }

    pub async fn flag_grace_expired(&self, session_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE sessions SET grace_expired = TRUE, updated_at = NOW() WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn resume_connected(&self, session_id: Uuid) -> Result<Session> {
        let updated = sqlx::query_as::<_, Session>(
            r#"
            UPDATE sessions
            SET status = 'in_progress', is_connected = TRUE, last_connected_at = NOW(),
                disconnected_at = NULL, paused_at = NULL, time_remaining_at_pause_secs = NULL,
                version = version + 1, updated_at = NOW()
            WHERE id = $1 AND status IN ('in_progress', 'paused')
            RETURNING *
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        updated.ok_or_else(|| Error::Conflict("Session is no longer live".to_string()))
    }

    /// Rebuilds a corrupt snapshot from the live test definition and
    /// reconciles section state around the navigation cursor. The
    /// question order may have changed, so the cursor resets to 0.
    async fn recover_session(&self, session: &Session) -> Result<Session> {
        let test = sqlx::query_as::<_, TestRow>("SELECT * FROM tests WHERE id = $1")
            .bind(session.test_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                Error::RecoveryFailure("Original test definition no longer exists".to_string())
            })?;

        let mut snapshot = SnapshotBuilder::build(&test, session.user_id)
            .map_err(|e| Error::RecoveryFailure(format!("Snapshot rebuild failed: {}", e)))?;

        let now = Utc::now();
        if snapshot.settings.use_sections {
            let cursor = session.current_section_index as usize;
            if cursor >= snapshot.sections.len() {
                return Err(Error::RecoveryFailure(
                    "Section cursor is beyond the rebuilt test".to_string(),
                ));
            }
            for (i, section) in snapshot.sections.iter_mut().enumerate() {
                if i < cursor {
                    section.status = SectionStatus::Submitted;
                    section.submitted_at = Some(now);
                } else if i == cursor {
                    section.status = SectionStatus::InProgress;
                    section.started_at = Some(now);
                } else {
                    section.status = SectionStatus::NotStarted;
                }
            }
        }
        let completed_sections: Vec<i32> = (0..session.current_section_index).collect();
        let snapshot_json = serde_json::to_value(&snapshot)?;

        let recovered = sqlx::query_as::<_, Session>(
            r#"
            UPDATE sessions
            SET snapshot = $1, current_question_index = 0, completed_sections = $2,
                review_phase = FALSE, version = version + 1, updated_at = NOW()
            WHERE id = $3
            RETURNING *
            "#,
        )
        .bind(&snapshot_json)
        .bind(&completed_sections)
        .bind(session.id)
        .fetch_one(&self.pool)
        .await?;

        tracing::warn!(session_id = %session.id, "session recovered from corrupt snapshot");
        Ok(recovered)
    }

    async fn mark_failed(&self, session_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'failed', completed_at = NOW(), is_connected = FALSE,
                version = version + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
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
}
