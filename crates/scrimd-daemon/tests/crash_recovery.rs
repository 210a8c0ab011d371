//! Crash-recovery tests: persist, reload from the store, and verify
//! the automation tick re-sends nothing that was already delivered.

use std::sync::Arc;

use scrimd_core::checkin::CheckinMark;
use scrimd_core::config::EventConfig;
use scrimd_core::notify::{Destination, MessagingSink, ParticipantId};
use scrimd_core::store::SnapshotStore;
use scrimd_core::time::{Clock, FixedClock};
use scrimd_core::unit::UnitId;
use scrimd_daemon::orchestrator::Orchestrator;
use scrimd_daemon::outbox::{MemorySink, SinkRecord};
use scrimd_daemon::render::DisabledRenderer;
use scrimd_daemon::roster::FixedRoster;
use scrimd_daemon::state::UnitHandle;

fn unit() -> UnitId {
    UnitId::new("or40").unwrap()
}

fn config() -> Arc<EventConfig> {
    Arc::new(
        EventConfig::from_toml(
            r#"
                [[units]]
                id = "or40"
            "#,
        )
        .unwrap(),
    )
}

fn orchestrator(
    store: &SnapshotStore,
    clock: &Arc<FixedClock>,
    sink: &Arc<MemorySink>,
) -> Orchestrator {
    let handle = Arc::new(UnitHandle::open(unit(), store.clone()).unwrap());
    Orchestrator::new(
        handle,
        config(),
        Arc::clone(clock) as Arc<dyn Clock>,
        Arc::clone(sink) as Arc<dyn MessagingSink>,
        Arc::new(FixedRoster::of(&["001", "002", "003"])),
        Arc::new(DisabledRenderer),
    )
}

async fn tick(orchestrator: &Orchestrator) {
    let _ = orchestrator.tick_checkin().await;
    let _ = orchestrator.tick_distribution().await;
    let _ = orchestrator.tick_cleanup().await;
    let _ = orchestrator.tick_rollover().await;
}

#[tokio::test]
async fn test_restart_does_not_resend_credential_or_checkin_phases() {
    let dir = tempfile::tempdir().unwrap();
    let store = SnapshotStore::open(dir.path()).unwrap();
    let clock = Arc::new(FixedClock::at("2026-08-07T21:58:00+09:00"));

    // First life: check-in phases fire, check-in closes (arming
    // automatic mode), then the round 1 credential goes out at start
    // time.
    let sink_a = Arc::new(MemorySink::new());
    let live = orchestrator(&store, &clock, &sink_a);
    tick(&live).await;
    clock.set("2026-08-07T22:00:00+09:00");
    tick(&live).await;

    assert_eq!(sink_a.sends_to(&Destination::Holder).len(), 1);
    let phase_sends = sink_a
        .records()
        .iter()
        .filter(|(_, r)| {
            matches!(
                r,
                SinkRecord::Send {
                    destination: Destination::Participant { .. },
                    ..
                }
            )
        })
        .count();
    // Open + reminder to all three unoperated members each.
    assert_eq!(phase_sends, 6);

    // Simulated restart: a fresh handle reloads the snapshot; the
    // next tick must not repeat anything already delivered.
    let sink_b = Arc::new(MemorySink::new());
    clock.advance_seconds(15);
    let revived = orchestrator(&store, &clock, &sink_b);
    tick(&revived).await;

    assert!(
        sink_b.records().is_empty(),
        "restart re-sent: {:?}",
        sink_b.records()
    );
    let status = revived.status().await;
    assert!(status.credential.is_some());
    assert_eq!(status.round_number, 1);
}

#[tokio::test]
async fn test_restart_preserves_checkin_marks_and_flags() {
    let dir = tempfile::tempdir().unwrap();
    let store = SnapshotStore::open(dir.path()).unwrap();
    let clock = Arc::new(FixedClock::at("2026-08-07T21:40:00+09:00"));

    let sink = Arc::new(MemorySink::new());
    let live = orchestrator(&store, &clock, &sink);
    tick(&live).await;
    live.checkin_mark(ParticipantId::new("001").unwrap(), CheckinMark::CheckedIn)
        .await
        .unwrap();
    live.checkin_mark(ParticipantId::new("002").unwrap(), CheckinMark::Declined)
        .await
        .unwrap();
    live.emergency_stop().await.unwrap();

    let revived = orchestrator(&store, &clock, &Arc::new(MemorySink::new()));
    let status = revived.status().await;
    assert_eq!(status.checked_in, 1);
    assert_eq!(status.declined, 1);
    assert_eq!(status.unoperated, 1);
    assert!(status.emergency_stop);
}

#[tokio::test]
async fn test_restart_keeps_deferred_send_parked() {
    let dir = tempfile::tempdir().unwrap();
    let store = SnapshotStore::open(dir.path()).unwrap();
    let clock = Arc::new(FixedClock::at("2026-08-07T22:00:00+09:00"));

    let sink = Arc::new(MemorySink::new());
    let live = orchestrator(&store, &clock, &sink);

    // Round 1 played through to a result, with the next distribution
    // landing inside a blackout.
    live.distribute_credential_manual().await.unwrap();
    live.confirm_departure().await.unwrap();
    clock.set("2026-08-07T22:03:00+09:00");
    live.begin_round().await.unwrap();
    live.request_result(vec![]).await.unwrap();
    clock.set("2026-08-07T22:10:00+09:00");
    live.set_pause_remaining_minutes(5).await.unwrap();
    let reply = live.submit_result().await.unwrap();
    assert!(reply.contains("22:15"), "unexpected reply: {reply}");

    // Restart before the release time: the parked send survives and
    // releases on the first tick past the window.
    let sink_b = Arc::new(MemorySink::new());
    let revived = orchestrator(&store, &clock, &sink_b);
    revived.set_auto(true).await.unwrap();
    let status = revived.status().await;
    assert_eq!(status.pending_send_at.map(|t| t.to_string()), Some("22:15".into()));

    clock.set("2026-08-07T22:15:00+09:00");
    let _ = revived.tick_distribution().await;
    let status = revived.status().await;
    assert_eq!(status.round_number, 2);
    assert!(status.credential.is_some());
    assert_eq!(sink_b.sends_to(&Destination::Holder).len(), 1);
}
