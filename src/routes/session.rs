use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Extension,
};
use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;
use validator::Validate;

use crate::dto::session_dto::{
    HeartbeatResponse, NavigateRequest, RejoinCheckResponse, SessionResponse, SkipQuestionRequest,
    StartSessionRequest, StartSessionResponse, SubmitAnswerRequest, SubmitTestResponse,
};
use crate::middleware::auth::AuthContext;
use crate::services::grading_service::{GradingService, SessionOutcome};
use crate::services::navigator_service::NavigatorService;
use crate::services::sandbox_service::SandboxService;
use crate::services::session_service::SessionService;
use crate::services::timer_service::{effective_remaining, TimerScope};
use crate::AppState;

fn arm_timers(
    state: &AppState,
    session: &crate::models::session::Session,
    snapshot: &crate::models::snapshot::TestSnapshot,
) {
    let (remaining, scope) = effective_remaining(session, snapshot, Utc::now());
    state
        .timers
        .start(session.id, Duration::from_secs(remaining.max(0) as u64), scope);
}

#[utoipa::path(
    post,
    path = "/api/sessions",
    request_body = StartSessionRequest,
    responses(
        (status = 201, description = "Session created", body = Json<StartSessionResponse>),
        (status = 403, description = "Access or attempt-limit check failed"),
        (status = 409, description = "A rejoinable session already exists")
    )
)]
#[axum::debug_handler]
pub async fn start_session(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<StartSessionRequest>,
) -> crate::error::Result<Response> {
    req.validate()?;
    let svc = SessionService::new(state.pool.clone());
    let (session, snapshot, abandoned_old) =
        svc.create_session(&auth, req.test_id, req.force_new).await?;

    if let Some(old_id) = abandoned_old {
        state.timers.clear(old_id);
        state.realtime.drop_channel(old_id);
    }
    arm_timers(&state, &session, &snapshot);

    let navigator = NavigatorService::new(state.pool.clone());
    let current_question = navigator.get_current_question(session.id, &auth).await?;

    let response = StartSessionResponse {
        session: SessionResponse::from_session(&session, &snapshot),
        current_question,
    };
    Ok((StatusCode::CREATED, Json(response)).into_response())
}

#[utoipa::path(
    get,
    path = "/api/sessions/rejoinable",
    responses(
        (status = 200, description = "Rejoin check result", body = Json<RejoinCheckResponse>)
    )
)]
#[axum::debug_handler]
pub async fn check_rejoin(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> crate::error::Result<Response> {
    let svc = SessionService::new(state.pool.clone());
    let response = match svc.check_rejoin(&auth).await? {
        Some(check) => RejoinCheckResponse {
            rejoinable: true,
            session: Some(SessionResponse::from_session(&check.session, &check.snapshot)),
            recovered: check.recovered,
        },
        None => RejoinCheckResponse {
            rejoinable: false,
            session: None,
            recovered: false,
        },
    };
    Ok(Json(response).into_response())
}

#[utoipa::path(
    post,
    path = "/api/sessions/{id}/rejoin",
    params(("id" = Uuid, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Session resumed", body = Json<SessionResponse>),
        (status = 422, description = "Session expired or not rejoinable")
    )
)]
#[axum::debug_handler]
pub async fn rejoin_session(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> crate::error::Result<Response> {
    let svc = SessionService::new(state.pool.clone());
    let session = svc.rejoin_session(id, &auth).await?;
    let snapshot = session.snapshot()?;

    state.timers.cancel_grace(id);
    arm_timers(&state, &session, &snapshot);

    tracing::info!(session_id = %id, user_id = %auth.user_id, "session rejoined");
    Ok(Json(SessionResponse::from_session(&session, &snapshot)).into_response())
}

#[utoipa::path(
    post,
    path = "/api/sessions/{id}/abandon",
    params(("id" = Uuid, Path, description = "Session ID")),
    responses((status = 200, description = "Session abandoned"))
)]
#[axum::debug_handler]
pub async fn abandon_session(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> crate::error::Result<Response> {
    let svc = SessionService::new(state.pool.clone());
    // Ownership first, then cancel timers before the status write so a
    // stale expiration cannot fire after abandonment.
    svc.get_session(id, &auth).await?;
    state.timers.clear(id);
    svc.abandon_session(id, &auth).await?;
    state.realtime.drop_channel(id);
    Ok(Json(json!({ "status": "abandoned" })).into_response())
}

#[axum::debug_handler]
pub async fn get_session(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> crate::error::Result<Response> {
    let svc = SessionService::new(state.pool.clone());
    let session = svc.get_session(id, &auth).await?;
    let snapshot = session.snapshot()?;
    Ok(Json(SessionResponse::from_session(&session, &snapshot)).into_response())
}

#[utoipa::path(
    get,
    path = "/api/sessions/{id}/question",
    params(("id" = Uuid, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Current question, sanitized"),
        (status = 422, description = "Session not in progress")
    )
)]
#[axum::debug_handler]
pub async fn get_current_question(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> crate::error::Result<Response> {
    let navigator = NavigatorService::new(state.pool.clone());
    let response = navigator.get_current_question(id, &auth).await?;
    Ok(Json(response).into_response())
}

#[utoipa::path(
    post,
    path = "/api/sessions/{id}/answer",
    params(("id" = Uuid, Path, description = "Session ID")),
    request_body = SubmitAnswerRequest,
    responses(
        (status = 200, description = "Answer recorded; outcome describes what happened next")
    )
)]
#[axum::debug_handler]
pub async fn submit_answer(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(req): Json<SubmitAnswerRequest>,
) -> crate::error::Result<Response> {
    req.validate()?;
    let navigator = NavigatorService::new(state.pool.clone());
    let outcome = navigator.submit_answer(id, &auth, req).await?;
    state.realtime.publish(
        id,
        json!({ "event": "answer_processed", "result": &outcome }),
    );
    Ok(Json(outcome).into_response())
}

#[axum::debug_handler]
pub async fn skip_question(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(req): Json<SkipQuestionRequest>,
) -> crate::error::Result<Response> {
    req.validate()?;
    let navigator = NavigatorService::new(state.pool.clone());
    let outcome = navigator.skip_question(id, &auth, req).await?;
    Ok(Json(outcome).into_response())
}

#[axum::debug_handler]
pub async fn navigate_to_question(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(req): Json<NavigateRequest>,
) -> crate::error::Result<Response> {
    req.validate()?;
    let navigator = NavigatorService::new(state.pool.clone());
    let response = navigator.navigate_to(id, &auth, req.question_index).await?;
    Ok(Json(response).into_response())
}

#[axum::debug_handler]
pub async fn start_section_review(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> crate::error::Result<Response> {
    let navigator = NavigatorService::new(state.pool.clone());
    let summary = navigator.start_section_review(id, &auth).await?;
    Ok(Json(summary).into_response())
}

#[utoipa::path(
    post,
    path = "/api/sessions/{id}/section/submit",
    params(("id" = Uuid, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Section submitted; advances or reports test-complete"),
        (status = 409, description = "Section was already submitted")
    )
)]
#[axum::debug_handler]
pub async fn submit_section(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> crate::error::Result<Response> {
    let navigator = NavigatorService::new(state.pool.clone());
    let response = navigator.submit_section(id, &auth).await?;

    if let Some(remaining) = response.time_remaining_seconds {
        state.timers.start(
            id,
            Duration::from_secs(remaining.max(0) as u64),
            TimerScope::Section,
        );
    } else if response.test_complete {
        // Last section closed: the overall budget is all that is left.
        let svc = SessionService::new(state.pool.clone());
        let sync = svc.time_sync_system(id).await?;
        state.timers.start(
            id,
            Duration::from_secs(sync.time_remaining_seconds.max(0) as u64),
            TimerScope::Overall,
        );
    }

    Ok(Json(response).into_response())
}

#[utoipa::path(
    post,
    path = "/api/sessions/{id}/submit",
    params(("id" = Uuid, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Session graded exactly once", body = Json<SubmitTestResponse>),
        (status = 409, description = "A concurrent submit already graded the session"),
        (status = 422, description = "Unsubmitted sections remain")
    )
)]
#[axum::debug_handler]
pub async fn submit_test(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> crate::error::Result<Response> {
    let svc = SessionService::new(state.pool.clone());
    svc.get_session(id, &auth).await?;

    let grading = GradingService::new(state.pool.clone(), SandboxService::from_config());
    let (_result, final_score) = grading
        .finalize_session(id, SessionOutcome::Completed, false)
        .await?;

    state.timers.clear(id);
    state.realtime.publish(
        id,
        json!({ "event": "session_completed", "percentage": final_score.percentage }),
    );

    Ok(Json(SubmitTestResponse {
        session_id: id,
        status: "completed".to_string(),
        final_score,
        message: "Test submitted successfully".to_string(),
    })
    .into_response())
}

#[utoipa::path(
    post,
    path = "/api/sessions/{id}/heartbeat",
    params(("id" = Uuid, Path, description = "Session ID")),
    responses((status = 200, description = "Connectivity recorded; paused sessions resume"))
)]
#[axum::debug_handler]
pub async fn heartbeat(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> crate::error::Result<Response> {
    let svc = SessionService::new(state.pool.clone());
    let (session, resumed) = svc.heartbeat(id, &auth).await?;
    if resumed {
        state.timers.cancel_grace(id);
        if let Ok(snapshot) = session.snapshot() {
            arm_timers(&state, &session, &snapshot);
        }
    }
    let now = Utc::now();
    Ok(Json(HeartbeatResponse {
        status: session.status.clone(),
        resumed,
        time_remaining_seconds: session.overall_remaining_seconds(now),
    })
    .into_response())
}

#[utoipa::path(
    get,
    path = "/api/sessions/{id}/time-sync",
    params(("id" = Uuid, Path, description = "Session ID")),
    responses((status = 200, description = "Server-authoritative remaining time"))
)]
#[axum::debug_handler]
pub async fn time_sync(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> crate::error::Result<Response> {
    let svc = SessionService::new(state.pool.clone());
    let response = svc.time_sync(id, &auth).await?;
    Ok(Json(response).into_response())
}

/// Reported by the realtime transport when the student's socket drops.
/// Freezes the in-memory countdown and opens the reconnect grace window.
#[axum::debug_handler]
pub async fn disconnect(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> crate::error::Result<Response> {
    let svc = SessionService::new(state.pool.clone());
    let session = svc.mark_disconnected(id, &auth).await?;

    let grace = crate::config::get_config().grace_period_seconds;
    state.timers.pause(id);
    state.timers.start_grace(id, Duration::from_secs(grace.max(0) as u64));

    tracing::info!(session_id = %id, "session paused for disconnect; grace window open");
    Ok(Json(json!({
        "status": session.status,
        "grace_period_seconds": grace,
        "time_remaining_seconds": session.time_remaining_at_pause_secs,
    }))
    .into_response())
}
