use std::time::Duration;

use assessment_backend::services::timer_service::{TimerEvent, TimerScope, TimerService};
use uuid::Uuid;

// Disconnect/reconnect flow against the in-memory coordinator alone:
// the session pauses, the grace window opens, and a rejoin inside the
// window re-arms the countdown with the already-deducted remaining time.
#[tokio::test(start_paused = true)]
async fn disconnect_then_rejoin_within_grace_keeps_the_clock_running() {
    let (timers, mut rx) = TimerService::new();
    let session_id = Uuid::new_v4();

    // 10-minute budget.
    timers.start(session_id, Duration::from_secs(600), TimerScope::Overall);

    // 2 minutes in, the socket drops.
    tokio::time::advance(Duration::from_secs(120)).await;
    let frozen = timers.pause(session_id).unwrap();
    assert_eq!(frozen.as_secs(), 480);
    timers.start_grace(session_id, Duration::from_secs(300));

    // Reconnect 1 minute later. Wall clock kept counting: the caller
    // re-arms with deadline-derived remaining, not the frozen value.
    tokio::time::advance(Duration::from_secs(60)).await;
    let adjusted = frozen - Duration::from_secs(60);
    timers.resume(session_id, adjusted, TimerScope::Overall);

    // The grace timer was cancelled: no GraceElapsed may arrive, and the
    // next events are warnings leading into expiration.
    let mut saw_grace = false;
    let mut saw_expiry = false;
    while let Some(event) = rx.recv().await {
        match event {
            TimerEvent::GraceElapsed { .. } => saw_grace = true,
            TimerEvent::Expired { scope, .. } => {
                assert_eq!(scope, TimerScope::Overall);
                saw_expiry = true;
                break;
            }
            TimerEvent::Warning { .. } | TimerEvent::Sync { .. } => {}
        }
    }
    assert!(!saw_grace);
    assert!(saw_expiry);
}

#[tokio::test(start_paused = true)]
async fn grace_lapse_fires_exactly_one_abandonment_signal() {
    let (timers, mut rx) = TimerService::new();
    let session_id = Uuid::new_v4();

    timers.start(session_id, Duration::from_secs(600), TimerScope::Overall);
    tokio::time::advance(Duration::from_secs(10)).await;
    timers.pause(session_id);
    timers.start_grace(session_id, Duration::from_secs(300));

    let event = rx.recv().await.unwrap();
    assert_eq!(event, TimerEvent::GraceElapsed { session_id });

    // Nothing else is pending for this session.
    timers.clear(session_id);
    tokio::time::advance(Duration::from_secs(3600)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn independent_sessions_do_not_share_timers() {
    let (timers, mut rx) = TimerService::new();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    timers.start(a, Duration::from_secs(5), TimerScope::Overall);
    timers.start(b, Duration::from_secs(15), TimerScope::Section);
    timers.clear(b);

    let event = rx.recv().await.unwrap();
    assert_eq!(
        event,
        TimerEvent::Expired {
            session_id: a,
            scope: TimerScope::Overall
        }
    );
    tokio::time::advance(Duration::from_secs(60)).await;
    // b was cleared before its deadline; only sync ticks from a's loop
    // could remain, never an expiration for b.
    while let Ok(event) = rx.try_recv() {
        assert!(!matches!(event, TimerEvent::Expired { session_id, .. } if session_id == b));
    }
}
