use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use livechat_core::errors::SubsystemError;
use livechat_core::lifecycle::Subsystem;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// The local visitor's availability.
pub trait PresenceService: Subsystem {
    /// Record user activity; an away visitor comes back online.
    fn touch(&self);
    fn status(&self) -> PresenceStatus;
}

struct IdleTimer {
    cancel: CancellationToken,
    activity: Arc<Notify>,
    task: JoinHandle<()>,
}

/// Idle-timer based presence: online on init, away after `away_after` without
/// activity, offline once reset.
pub struct PresenceTracker {
    away_after: Duration,
    status_tx: watch::Sender<PresenceStatus>,
    timer: Mutex<Option<IdleTimer>>,
}

impl PresenceTracker {
    pub fn new(away_after: Duration) -> Self {
        let (status_tx, _) = watch::channel(PresenceStatus::Offline);
        Self {
            away_after,
            status_tx,
            timer: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PresenceStatus> {
        self.status_tx.subscribe()
    }
}

fn set_status(tx: &watch::Sender<PresenceStatus>, next: PresenceStatus) {
    let changed = tx.send_if_modified(|status| {
        if *status == next {
            return false;
        }
        *status = next;
        true
    });
    if changed {
        info!(status = ?next, "presence changed");
    }
}

async fn run_idle_timer(
    away_after: Duration,
    tx: watch::Sender<PresenceStatus>,
    activity: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        let online = *tx.borrow() == PresenceStatus::Online;
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = activity.notified() => set_status(&tx, PresenceStatus::Online),
            _ = tokio::time::sleep(away_after), if online => set_status(&tx, PresenceStatus::Away),
        }
    }
    debug!("presence idle timer stopped");
}

impl PresenceService for PresenceTracker {
    fn touch(&self) {
        if let Some(timer) = self.timer.lock().as_ref() {
            timer.activity.notify_one();
        }
    }

    fn status(&self) -> PresenceStatus {
        *self.status_tx.borrow()
    }
}

#[async_trait]
impl Subsystem for PresenceTracker {
    fn name(&self) -> &'static str {
        "presence"
    }

    async fn init(&self) -> Result<(), SubsystemError> {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return Ok(());
        }
        set_status(&self.status_tx, PresenceStatus::Online);
        let cancel = CancellationToken::new();
        let activity = Arc::new(Notify::new());
        let task = tokio::spawn(run_idle_timer(
            self.away_after,
            self.status_tx.clone(),
            Arc::clone(&activity),
            cancel.clone(),
        ));
        *timer = Some(IdleTimer {
            cancel,
            activity,
            task,
        });
        Ok(())
    }

    async fn reset(&self) -> Result<(), SubsystemError> {
        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            timer.cancel.cancel();
            if let Err(e) = timer.task.await {
                if e.is_panic() {
                    return Err(SubsystemError::failed(self.name(), "idle timer panicked"));
                }
            }
        }
        set_status(&self.status_tx, PresenceStatus::Offline);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn online_then_away_after_idle() {
        let tracker = PresenceTracker::new(Duration::from_secs(60));
        let mut rx = tracker.subscribe();
        assert_eq!(tracker.status(), PresenceStatus::Offline);

        tracker.init().await.unwrap();
        assert_eq!(tracker.status(), PresenceStatus::Online);
        rx.mark_unchanged();

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), PresenceStatus::Away);
        tracker.reset().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn activity_returns_online() {
        let tracker = PresenceTracker::new(Duration::from_secs(60));
        let mut rx = tracker.subscribe();
        tracker.init().await.unwrap();
        rx.mark_unchanged();

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), PresenceStatus::Away);

        tracker.touch();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), PresenceStatus::Online);
        tracker.reset().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn activity_postpones_away() {
        let tracker = PresenceTracker::new(Duration::from_secs(60));
        tracker.init().await.unwrap();

        tokio::time::sleep(Duration::from_secs(45)).await;
        tracker.touch();
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(tracker.status(), PresenceStatus::Online);
        tracker.reset().await.unwrap();
    }

    #[tokio::test]
    async fn reset_goes_offline_and_is_idempotent() {
        let tracker = PresenceTracker::new(Duration::from_secs(60));
        tracker.reset().await.unwrap();
        tracker.init().await.unwrap();
        tracker.init().await.unwrap();
        tracker.reset().await.unwrap();
        tracker.reset().await.unwrap();
        assert_eq!(tracker.status(), PresenceStatus::Offline);

        // touch after reset has nothing to wake
        tracker.touch();
        assert_eq!(tracker.status(), PresenceStatus::Offline);
    }
}
