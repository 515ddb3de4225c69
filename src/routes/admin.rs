use axum::{
    extract::{Path, State},
    response::{IntoResponse, Json, Response},
    Extension,
};
use uuid::Uuid;

use crate::dto::admin_dto::{AdminSessionResponse, TestStatsResponse};
use crate::error::{Error, Result};
use crate::middleware::auth::AuthContext;
use crate::models::test_definition::TestRow;
use crate::models::test_stats::TestStats;
use crate::services::session_service::SessionService;
use crate::AppState;

#[utoipa::path(
    get,
    path = "/api/admin/sessions/{id}",
    params(("id" = Uuid, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Full session detail", body = Json<AdminSessionResponse>),
        (status = 403, description = "Session outside caller's organization")
    )
)]
#[axum::debug_handler]
pub async fn get_session(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Response> {
    let svc = SessionService::new(state.pool.clone());
    let session = svc.get_session_for_admin(id, &auth).await?;
    Ok(Json(AdminSessionResponse::from(session)).into_response())
}

#[utoipa::path(
    get,
    path = "/api/admin/tests/{id}/stats",
    params(("id" = Uuid, Path, description = "Test ID")),
    responses(
        (status = 200, description = "Aggregate attempt statistics", body = Json<TestStatsResponse>)
    )
)]
#[axum::debug_handler]
pub async fn get_test_stats(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Response> {
    let test = sqlx::query_as::<_, TestRow>("SELECT * FROM tests WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| Error::NotFound("Test not found".to_string()))?;
    if !auth.is_super_org_admin && test.organization_id != auth.organization_id {
        return Err(Error::Forbidden(
            "Test belongs to a different organization".to_string(),
        ));
    }

    let stats = sqlx::query_as::<_, TestStats>("SELECT * FROM test_stats WHERE test_id = $1")
        .bind(id)
        .fetch_optional(&state.pool)
        .await?;

    let response = match stats {
        Some(s) => TestStatsResponse {
            test_id: s.test_id,
            attempts_count: s.attempts_count,
            pass_count: s.pass_count,
            average_percentage: if s.attempts_count > 0 {
                s.score_sum / s.attempts_count as f64
            } else {
                0.0
            },
            recent_percentages: s.recent_percentages,
        },
        None => TestStatsResponse {
            test_id: id,
            attempts_count: 0,
            pass_count: 0,
            average_percentage: 0.0,
            recent_percentages: Vec::new(),
        },
    };
    Ok(Json(response).into_response())
}
