use crate::reconcile::Tracker;
use crate::source::SignalSource;
use crate::storage::StorageEngine;
use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

/// Drive `tracker` every `period` until `shutdown` resolves.
///
/// The first tick fires immediately. Each tick runs to completion before the
/// timer is polled again, and a tick that overruns the period delays the next
/// one instead of bursting. Returns the number of ticks attempted.
pub async fn run<S, P, F>(tracker: &Tracker<S, P>, period: Duration, shutdown: F) -> u64
where
    S: StorageEngine + ?Sized,
    P: SignalSource,
    F: Future<Output = ()>,
{
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    info!(period_ms = period.as_millis() as u64, "scheduler started");
    let mut ticks = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = timer.tick() => {}
        }

        ticks += 1;
        if let Err(err) = tracker.tick(Utc::now()).await {
            error!(tick = ticks, transient = err.is_transient(), error = %err, "tick aborted");
        }
    }

    info!(ticks, "scheduler stopped");
    ticks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GroupConfig, TrackerConfig};
    use crate::core::{GroupId, MemberId, RoleId};
    use crate::source::{Presence, PresenceStatus, RosterMember, SnapshotSignalSource};
    use crate::storage::InMemoryStorage;
    use std::collections::HashSet;
    use std::sync::Arc;

    async fn tracker() -> Tracker<InMemoryStorage, SnapshotSignalSource> {
        let source = SnapshotSignalSource::new();
        source
            .add_member(
                GroupId(1),
                RosterMember {
                    id: MemberId(7),
                    display_name: "U".to_string(),
                    roles: HashSet::from([RoleId(10)]),
                },
            )
            .await;
        source
            .set_presence(MemberId(7), Presence::playing(PresenceStatus::Online, "Skyrim"))
            .await;
        let config =
            TrackerConfig::new().group(GroupConfig::new(GroupId(1)).role("admin", RoleId(10)));
        Tracker::start(Arc::new(InMemoryStorage::new()), source, &config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_runs_until_shutdown() {
        let tracker = tracker().await;
        let ticks = run(
            &tracker,
            Duration::from_millis(10),
            tokio::time::sleep(Duration::from_millis(60)),
        )
        .await;

        assert!(ticks >= 2);
        let open = tracker.sessions().list_open_sessions(MemberId(7)).await.unwrap();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn test_aborted_ticks_do_not_stop_the_loop() {
        let tracker = tracker().await;
        tracker.source().set_unavailable(true);

        let ticks = run(
            &tracker,
            Duration::from_millis(10),
            tokio::time::sleep(Duration::from_millis(60)),
        )
        .await;

        assert!(ticks >= 2);
        assert!(tracker.storage().member_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ready_shutdown_runs_no_tick() {
        let tracker = tracker().await;
        let ticks = run(&tracker, Duration::from_secs(60), std::future::ready(())).await;
        assert_eq!(ticks, 0);
    }
}
