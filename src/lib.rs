pub mod config;
pub mod database;
pub mod dto;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod utils;

use crate::services::realtime_service::RealtimeService;
use crate::services::timer_service::TimerService;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub timers: Arc<TimerService>,
    pub realtime: Arc<RealtimeService>,
}

impl AppState {
    pub fn new(pool: PgPool, timers: Arc<TimerService>, realtime: Arc<RealtimeService>) -> Self {
        Self {
            pool,
            timers,
            realtime,
        }
    }
}
