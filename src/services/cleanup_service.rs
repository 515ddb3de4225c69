use crate::error::Result;
use crate::services::grading_service::GradingService;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Background reconciliation pass. The in-memory Timer Coordinator does
/// not survive a process restart; this sweep over persisted state is the
/// authoritative backstop for anything it missed. All three rules are
/// idempotent.
#[derive(Clone)]
pub struct CleanupService {
    pool: PgPool,
}

impl CleanupService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_once(&self, grading: &GradingService) -> Result<()> {
        let config = crate::config::get_config();
        let now = Utc::now();

        // 1. Paused sessions whose student has been gone for a day.
        let stale_cutoff = now - Duration::hours(config.disconnect_abandon_hours);
        let stale: Vec<Uuid> = sqlx::query_scalar(
            r#"SELECT id FROM sessions
               WHERE status = 'paused' AND disconnected_at IS NOT NULL AND disconnected_at < $1"#,
        )
        .bind(stale_cutoff)
        .fetch_all(&self.pool)
        .await?;
        for id in &stale {
            if let Err(e) = grading.abandon_session(*id).await {
                tracing::error!(session_id = %id, error = ?e, "sweep: abandon of stale session failed");
            }
        }

        // 2. Paused sessions whose grace window lapsed but whose
        //    in-memory grace timer was lost (crash/restart).
        let grace_cutoff = now - Duration::seconds(config.grace_period_seconds);
        let lapsed: Vec<Uuid> = sqlx::query_scalar(
            r#"SELECT id FROM sessions
               WHERE status = 'paused' AND paused_at IS NOT NULL AND paused_at < $1
                 AND grace_expired = FALSE"#,
        )
        .bind(grace_cutoff)
        .fetch_all(&self.pool)
        .await?;
        for id in &lapsed {
            sqlx::query("UPDATE sessions SET grace_expired = TRUE, updated_at = NOW() WHERE id = $1")
                .bind(*id)
                .execute(&self.pool)
                .await?;
            if let Err(e) = grading.abandon_session(*id).await {
                tracing::error!(session_id = %id, error = ?e, "sweep: abandon after grace lapse failed");
            }
        }

        // 3. Running sessions past their deadline whose expiration timer
        //    never fired.
        let overdue: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM sessions WHERE status = 'in_progress' AND expires_at <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        for id in &overdue {
            if let Err(e) = grading.expire_session(*id).await {
                tracing::error!(session_id = %id, error = ?e, "sweep: expire of overdue session failed");
            }
        }

        if !stale.is_empty() || !lapsed.is_empty() || !overdue.is_empty() {
            tracing::info!(
                stale = stale.len(),
                grace_lapsed = lapsed.len(),
                overdue = overdue.len(),
                "cleanup sweep reconciled sessions"
            );
        }

        Ok(())
    }
}
