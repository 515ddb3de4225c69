use assessment_backend::services::cleanup_service::CleanupService;
use assessment_backend::services::grading_service::GradingService;
use assessment_backend::services::realtime_service::RealtimeService;
use assessment_backend::services::sandbox_service::SandboxService;
use assessment_backend::services::timer_service::{run_timer_dispatcher, TimerService};
use assessment_backend::{
    config::{get_config, init_config},
    database::pool::create_pool,
    routes, AppState,
};
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    init_config()?;
    let config = get_config();

    let pool = create_pool().await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let (timers, timer_events) = TimerService::new();
    let realtime = Arc::new(RealtimeService::new());
    let app_state = AppState::new(pool, timers, realtime);

    {
        let state = app_state.clone();
        tokio::spawn(async move {
            run_timer_dispatcher(state, timer_events).await;
        });
    }

    {
        let state = app_state.clone();
        let interval = Duration::from_secs(config.sweep_interval_seconds.max(1));
        tokio::spawn(async move {
            let sweeper = CleanupService::new(state.pool.clone());
            let grading =
                GradingService::new(state.pool.clone(), SandboxService::from_config());
            loop {
                if let Err(e) = sweeper.run_once(&grading).await {
                    tracing::error!(error = ?e, "cleanup sweep failed");
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    let base_routes = Router::new().route("/health", get(routes::health::health));

    let student_api = Router::new()
        .route(
            "/api/sessions",
            post(routes::session::start_session),
        )
        .route(
            "/api/sessions/rejoinable",
            get(routes::session::check_rejoin),
        )
        .route(
            "/api/sessions/:id",
            get(routes::session::get_session),
        )
        .route(
            "/api/sessions/:id/rejoin",
            post(routes::session::rejoin_session),
        )
        .route(
            "/api/sessions/:id/abandon",
            post(routes::session::abandon_session),
        )
        .route(
            "/api/sessions/:id/question",
            get(routes::session::get_current_question),
        )
        .route(
            "/api/sessions/:id/answer",
            post(routes::session::submit_answer),
        )
        .route(
            "/api/sessions/:id/skip",
            post(routes::session::skip_question),
        )
        .route(
            "/api/sessions/:id/navigate",
            post(routes::session::navigate_to_question),
        )
        .route(
            "/api/sessions/:id/section/review",
            post(routes::session::start_section_review),
        )
        .route(
            "/api/sessions/:id/section/submit",
            post(routes::session::submit_section),
        )
        .route(
            "/api/sessions/:id/submit",
            post(routes::session::submit_test),
        )
        .route(
            "/api/sessions/:id/heartbeat",
            post(routes::session::heartbeat),
        )
        .route(
            "/api/sessions/:id/time-sync",
            get(routes::session::time_sync),
        )
        .route(
            "/api/sessions/:id/disconnect",
            post(routes::session::disconnect),
        )
        .layer(axum::middleware::from_fn_with_state(
            assessment_backend::middleware::rate_limit::new_rps_state(config.student_rps),
            assessment_backend::middleware::rate_limit::rps_middleware,
        ))
        .layer(axum::middleware::from_fn(
            assessment_backend::middleware::auth::require_auth,
        ));

    let admin_api = Router::new()
        .route(
            "/api/admin/sessions/:id",
            get(routes::admin::get_session),
        )
        .route(
            "/api/admin/tests/:id/stats",
            get(routes::admin::get_test_stats),
        )
        .layer(axum::middleware::from_fn_with_state(
            assessment_backend::middleware::rate_limit::new_rps_state(config.admin_rps),
            assessment_backend::middleware::rate_limit::rps_middleware,
        ))
        .layer(axum::middleware::from_fn(
            assessment_backend::middleware::auth::require_staff,
        ));

    let app = base_routes
        .merge(student_api)
        .merge(admin_api)
        .with_state(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.server_address.parse()?;
    info!("Server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
