use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Extra attempts granted to a student for a test. Managed by the admin
/// surface; the session engine only reads it during attempt accounting.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StudentTestOverride {
    pub id: Uuid,
    pub user_id: Uuid,
    pub test_id: Uuid,
    pub extra_attempts: i32,
    pub granted_by: Option<Uuid>,
    pub created_at: Option<DateTime<Utc>>,
}
