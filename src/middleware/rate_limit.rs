use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use crate::middleware::auth::AuthContext;

#[derive(Debug)]
struct Window {
    start: Instant,
    count: u32,
}

/// Fixed-window limiter keyed per student, so one aggressive client cannot
/// starve everyone else taking a test at the same time.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    rps: u32,
    windows: Arc<Mutex<HashMap<Uuid, Window>>>,
}

impl RateLimiter {
    fn new(rps: u32) -> Self {
        Self {
            rps: rps.max(1),
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn allow(&self, key: Uuid) -> bool {
        let mut guard = self.windows.lock().expect("rate limiter mutex poisoned");
        let now = Instant::now();

        if guard.len() > 4096 {
            guard.retain(|_, w| now.duration_since(w.start) < Duration::from_secs(2));
        }

        let window = guard.entry(key).or_insert(Window {
            start: now,
            count: 0,
        });
        if now.duration_since(window.start) >= Duration::from_secs(1) {
            window.start = now;
            window.count = 0;
        }
        if window.count < self.rps {
            window.count += 1;
            true
        } else {
            false
        }
    }
}

pub async fn rps_middleware(
    State(state): State<RateLimiter>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let key = req
        .extensions()
        .get::<AuthContext>()
        .map(|ctx| ctx.user_id)
        .unwrap_or(Uuid::nil());
    if !state.allow(key) {
        return (StatusCode::TOO_MANY_REQUESTS, "rate_limit_exceeded").into_response();
    }
    next.run(req).await
}

pub fn new_rps_state(rps: u32) -> RateLimiter {
    RateLimiter::new(rps)
}
