//! Live measurement feed
//!
//! Polls a collaborator for its current measurement state at frame rate and
//! forwards changes through the coalesced payload path.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::payload::{MeasurementSnapshot, Payload};
use crate::session::{SessionManager, SessionState};

/// Something that can report the current measurement on demand
pub trait MeasurementSource: Send + 'static {
    /// Current state, or `None` when nothing is being measured
    fn snapshot(&mut self) -> Option<MeasurementSnapshot>;
}

impl<F> MeasurementSource for F
where
    F: FnMut() -> Option<MeasurementSnapshot> + Send + 'static,
{
    fn snapshot(&mut self) -> Option<MeasurementSnapshot> {
        self()
    }
}

/// Poll `source` every `interval` until the session ends
pub(crate) fn spawn_feed<S: MeasurementSource>(
    manager: SessionManager,
    mut source: S,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last: Option<MeasurementSnapshot> = None;

        loop {
            ticker.tick().await;
            if manager.snapshot().state == SessionState::Ended {
                break;
            }

            let Some(current) = source.snapshot() else {
                continue;
            };
            if last.as_ref() == Some(&current) {
                continue;
            }
            manager.sync_payload(Payload::Measure(current.clone())).await;
            last = Some(current);
        }

        debug!("Measurement feed stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::AppConfig;
    use crate::identity::Role;
    use crate::testing::{FakeAcquirer, FakeRendezvous};

    fn reading(total: &str, count: u32) -> MeasurementSnapshot {
        MeasurementSnapshot {
            total: total.to_string(),
            count,
            active: Some(true),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_forwards_changes_only() {
        let rendezvous = Arc::new(FakeRendezvous::new());
        let manager = SessionManager::start(
            Role::Initiator,
            "ABCD",
            AppConfig::default(),
            rendezvous.clone(),
            Arc::new(FakeAcquirer::new()),
        )
        .unwrap();

        let mut rx = manager.watch();
        rx.wait_for(|s| s.link_state == crate::datalink::LinkState::Connecting)
            .await
            .unwrap();
        rendezvous.links()[0].open();
        rx.wait_for(|s| s.data_link_open).await.unwrap();

        let mut polls = 0u32;
        let feed = manager.attach_measurements(move || {
            polls += 1;
            if polls < 10 {
                Some(reading("1.00 m", 2))
            } else {
                Some(reading("2.50 m", 3))
            }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        let sent = rendezvous.links()[0].sent_payloads();
        assert_eq!(
            sent,
            vec![
                Payload::Measure(reading("1.00 m", 2)),
                Payload::Measure(reading("2.50 m", 3)),
            ]
        );

        manager.end_session().await;
        tokio::time::timeout(Duration::from_secs(1), feed)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_source_sends_nothing() {
        let rendezvous = Arc::new(FakeRendezvous::new());
        let manager = SessionManager::start(
            Role::Initiator,
            "ABCD",
            AppConfig::default(),
            rendezvous.clone(),
            Arc::new(FakeAcquirer::new()),
        )
        .unwrap();
        let feed = manager.attach_measurements(|| None);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rendezvous
            .links()
            .iter()
            .all(|link| link.sent_payloads().is_empty()));

        manager.end_session().await;
        feed.await.unwrap();
    }
}
