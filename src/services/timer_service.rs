use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::models::session::Session;
use crate::models::snapshot::TestSnapshot;

pub const WARNING_THRESHOLDS_SECS: [u64; 3] = [300, 60, 30];
pub const SYNC_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerScope {
    Overall,
    Section,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Warning { session_id: Uuid, seconds_left: u64 },
    Sync { session_id: Uuid },
    Expired { session_id: Uuid, scope: TimerScope },
    GraceElapsed { session_id: Uuid },
}

struct SessionTimers {
    deadline: Instant,
    scope: TimerScope,
    paused_remaining: Option<Duration>,
    tasks: Vec<JoinHandle<()>>,
    grace: Option<JoinHandle<()>>,
}

impl SessionTimers {
    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn abort_grace(&mut self) {
        if let Some(task) = self.grace.take() {
            task.abort();
        }
    }
}

/// Process-local countdown/warning/sync timers keyed by session id. A UX
/// accelerator only: the persisted session row plus the Cleanup Sweeper
/// remain the source of truth, and nothing here survives a restart.
pub struct TimerService {
    inner: Mutex<HashMap<Uuid, SessionTimers>>,
    tx: UnboundedSender<TimerEvent>,
}

impl TimerService {
    pub fn new() -> (Arc<Self>, UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                inner: Mutex::new(HashMap::new()),
                tx,
            }),
            rx,
        )
    }

    /// Arms the expiration timer plus whichever warning thresholds the
    /// remaining budget still covers, and the periodic sync tick.
    pub fn start(&self, session_id: Uuid, remaining: Duration, scope: TimerScope) {
        let mut guard = self.inner.lock().expect("timer mutex poisoned");
        let entry = guard.entry(session_id).or_insert(SessionTimers {
            deadline: Instant::now() + remaining,
            scope,
            paused_remaining: None,
            tasks: Vec::new(),
            grace: None,
        });
        entry.abort_tasks();
        entry.deadline = Instant::now() + remaining;
        entry.scope = scope;
        entry.paused_remaining = None;

        let tx = self.tx.clone();
        entry.tasks.push(tokio::spawn(async move {
            sleep(remaining).await;
            let _ = tx.send(TimerEvent::Expired { session_id, scope });
        }));

        for threshold in WARNING_THRESHOLDS_SECS {
            let lead = Duration::from_secs(threshold);
            if lead >= remaining {
                continue;
            }
            let tx = self.tx.clone();
            entry.tasks.push(tokio::spawn(async move {
                sleep(remaining - lead).await;
                let _ = tx.send(TimerEvent::Warning {
                    session_id,
                    seconds_left: threshold,
                });
            }));
        }

        let tx = self.tx.clone();
        entry.tasks.push(tokio::spawn(async move {
            loop {
                sleep(SYNC_INTERVAL).await;
                if tx.send(TimerEvent::Sync { session_id }).is_err() {
                    break;
                }
            }
        }));
    }

    /// Freezes the countdown and returns the captured remaining time.
    /// Used on disconnect; the grace timer is armed separately.
    pub fn pause(&self, session_id: Uuid) -> Option<Duration> {
        let mut guard = self.inner.lock().expect("timer mutex poisoned");
        let entry = guard.get_mut(&session_id)?;
        entry.abort_tasks();
        let remaining = entry.deadline.saturating_duration_since(Instant::now());
        entry.paused_remaining = Some(remaining);
        Some(remaining)
    }

    /// Re-arms after a reconnect. The caller passes the authoritative
    /// remaining time recomputed from the persisted deadline, so time
    /// spent disconnected is already deducted.
    pub fn resume(&self, session_id: Uuid, remaining: Duration, scope: TimerScope) {
        self.cancel_grace(session_id);
        self.start(session_id, remaining, scope);
    }

    pub fn start_grace(&self, session_id: Uuid, window: Duration) {
        let mut guard = self.inner.lock().expect("timer mutex poisoned");
        let entry = guard.entry(session_id).or_insert(SessionTimers {
            deadline: Instant::now() + window,
            scope: TimerScope::Overall,
            paused_remaining: None,
            tasks: Vec::new(),
            grace: None,
        });
        entry.abort_grace();
        let tx = self.tx.clone();
        entry.grace = Some(tokio::spawn(async move {
            sleep(window).await;
            let _ = tx.send(TimerEvent::GraceElapsed { session_id });
        }));
    }

    pub fn cancel_grace(&self, session_id: Uuid) {
        let mut guard = self.inner.lock().expect("timer mutex poisoned");
        if let Some(entry) = guard.get_mut(&session_id) {
            entry.abort_grace();
        }
    }

    /// Cancels every pending timer for the session. Must run before or
    /// with any terminal status write so a stale expiration cannot fire
    /// after abandon/submit.
    pub fn clear(&self, session_id: Uuid) {
        let mut guard = self.inner.lock().expect("timer mutex poisoned");
        if let Some(mut entry) = guard.remove(&session_id) {
            entry.abort_tasks();
            entry.abort_grace();
        }
    }

    /// Deadline-based remaining time, or the frozen value while paused.
    /// A single subtraction from a fixed deadline, never accumulated.
    pub fn remaining(&self, session_id: Uuid) -> Option<Duration> {
        let guard = self.inner.lock().expect("timer mutex poisoned");
        let entry = guard.get(&session_id)?;
        match entry.paused_remaining {
            Some(frozen) => Some(frozen),
            None => Some(entry.deadline.saturating_duration_since(Instant::now())),
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().expect("timer mutex poisoned").len()
    }
}

/// Picks the deadline the in-memory timer should be armed with: the
/// section budget when it runs out before the overall one.
pub fn effective_remaining(
    session: &Session,
    snapshot: &TestSnapshot,
    now: chrono::DateTime<Utc>,
) -> (i64, TimerScope) {
    let overall = session.overall_remaining_seconds(now);
    match session.section_remaining_seconds(snapshot, now) {
        Some(section) if section < overall => (section, TimerScope::Section),
        _ => (overall, TimerScope::Overall),
    }
}

/// Consumes timer events and hands each one to the async session-update
/// path. Every callback is guarded: a failing handler is logged and
/// swallowed so it can never take the coordinator down.
pub async fn run_timer_dispatcher(state: crate::AppState, mut rx: UnboundedReceiver<TimerEvent>) {
    while let Some(event) = rx.recv().await {
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatch_event(&state, &event).await {
                tracing::error!(?event, error = ?e, "timer callback failed");
            }
        });
    }
}

async fn dispatch_event(state: &crate::AppState, event: &TimerEvent) -> crate::error::Result<()> {
    use crate::services::grading_service::{GradingService, SessionOutcome};
    use crate::services::navigator_service::{ForcedSectionOutcome, NavigatorService};
    use crate::services::sandbox_service::SandboxService;
    use crate::services::session_service::SessionService;

    match *event {
        TimerEvent::Warning {
            session_id,
            seconds_left,
        } => {
            state.realtime.publish(
                session_id,
                json!({ "event": "time_warning", "seconds_left": seconds_left }),
            );
            Ok(())
        }
        TimerEvent::Sync { session_id } => {
            let svc = SessionService::new(state.pool.clone());
            match svc.time_sync_system(session_id).await {
                Ok(sync) => {
                    state
                        .realtime
                        .publish(session_id, serde_json::to_value(&sync)?);
                }
                Err(e) => {
                    tracing::debug!(%session_id, error = ?e, "time sync skipped");
                }
            }
            Ok(())
        }
        TimerEvent::Expired {
            session_id,
            scope: TimerScope::Overall,
        } => {
            state.timers.clear(session_id);
            let grading = GradingService::new(state.pool.clone(), SandboxService::from_config());
            grading.expire_session(session_id).await?;
            state
                .realtime
                .publish(session_id, json!({ "event": "session_expired" }));
            Ok(())
        }
        TimerEvent::Expired {
            session_id,
            scope: TimerScope::Section,
        } => {
            let navigator = NavigatorService::new(state.pool.clone());
            match navigator.force_submit_section(session_id).await? {
                ForcedSectionOutcome::Advanced {
                    section_index,
                    remaining_seconds,
                } => {
                    state.timers.start(
                        session_id,
                        Duration::from_secs(remaining_seconds.max(0) as u64),
                        TimerScope::Section,
                    );
                    state.realtime.publish(
                        session_id,
                        json!({ "event": "section_expired", "advanced_to": section_index }),
                    );
                }
                ForcedSectionOutcome::TestComplete => {
                    state.timers.clear(session_id);
                    let grading =
                        GradingService::new(state.pool.clone(), SandboxService::from_config());
                    grading
                        .finalize_session(session_id, SessionOutcome::Completed, true)
                        .await?;
                    state
                        .realtime
                        .publish(session_id, json!({ "event": "session_completed" }));
                }
            }
            Ok(())
        }
        TimerEvent::GraceElapsed { session_id } => {
            state.timers.clear(session_id);
            let svc = SessionService::new(state.pool.clone());
            svc.flag_grace_expired(session_id).await?;
            let grading = GradingService::new(state.pool.clone(), SandboxService::from_config());
            grading.abandon_session(session_id).await?;
            state
                .realtime
                .publish(session_id, json!({ "event": "session_abandoned" }));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SID: Uuid = Uuid::nil();

    #[tokio::test(start_paused = true)]
    async fn expiration_fires_after_remaining_elapses() {
        let (timers, mut rx) = TimerService::new();
        timers.start(SID, Duration::from_secs(10), TimerScope::Overall);
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            TimerEvent::Expired {
                session_id: SID,
                scope: TimerScope::Overall
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn warnings_fire_in_descending_order_before_expiry() {
        let (timers, mut rx) = TimerService::new();
        // 6 minutes: every threshold fits.
        timers.start(SID, Duration::from_secs(360), TimerScope::Overall);
        let mut warnings = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                TimerEvent::Warning { seconds_left, .. } => warnings.push(seconds_left),
                TimerEvent::Expired { .. } => break,
                TimerEvent::Sync { .. } => {}
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(warnings, vec![300, 60, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn short_budget_skips_warnings_it_cannot_cover() {
        let (timers, mut rx) = TimerService::new();
        timers.start(SID, Duration::from_secs(25), TimerScope::Overall);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, TimerEvent::Expired { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_freezes_remaining_and_stops_expiry() {
        let (timers, mut rx) = TimerService::new();
        timers.start(SID, Duration::from_secs(100), TimerScope::Overall);
        tokio::time::advance(Duration::from_secs(20)).await;
        let frozen = timers.pause(SID).unwrap();
        assert_eq!(frozen.as_secs(), 80);
        // Remaining stays frozen while paused; no further events fire.
        tokio::time::advance(Duration::from_secs(500)).await;
        assert_eq!(timers.remaining(SID).unwrap().as_secs(), 80);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_rearms_with_caller_remaining() {
        let (timers, mut rx) = TimerService::new();
        timers.start(SID, Duration::from_secs(25), TimerScope::Overall);
        tokio::time::advance(Duration::from_secs(10)).await;
        timers.pause(SID);
        timers.resume(SID, Duration::from_secs(20), TimerScope::Overall);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, TimerEvent::Expired { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn grace_timer_fires_once_and_is_cancellable() {
        let (timers, mut rx) = TimerService::new();
        timers.start_grace(SID, Duration::from_secs(300));
        timers.cancel_grace(SID);
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(rx.try_recv().is_err());

        timers.start_grace(SID, Duration::from_secs(300));
        let event = rx.recv().await.unwrap();
        assert_eq!(event, TimerEvent::GraceElapsed { session_id: SID });
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_everything_for_the_session() {
        let (timers, mut rx) = TimerService::new();
        timers.start(SID, Duration::from_secs(60), TimerScope::Overall);
        timers.start_grace(SID, Duration::from_secs(30));
        timers.clear(SID);
        assert_eq!(timers.active_count(), 0);
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }
}
