//! Cron-driven scheduled actions.
//!
//! Owns cancellable tasks for the periodic batch reconnect and for
//! per-destination schedules (pre-approved router actions such as a nightly
//! forced reconnect). Tasks die with the scheduler, not with the process.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relay_core::{DestinationId, Router};

/// Actions a schedule is allowed to trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledAction {
    /// Force-reconnect the destination's room
    Reconnect,
}

impl ScheduledAction {
    /// Parse an action keyword from the destination store.
    pub fn parse(action: &str) -> Option<Self> {
        match action.trim() {
            "reconnect" => Some(Self::Reconnect),
            _ => None,
        }
    }
}

/// Owner of all scheduled tasks.
pub struct Scheduler {
    router: Arc<Router>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Whether an expression is a valid cron schedule.
    pub fn validate_expression(expression: &str) -> bool {
        Schedule::from_str(expression).is_ok()
    }

    /// Schedule the periodic batch reconnect of every live room.
    pub fn schedule_batch_reconnect(&self, expression: &str) -> anyhow::Result<()> {
        let schedule = Schedule::from_str(expression)
            .map_err(|e| anyhow::anyhow!("Invalid reconnect schedule {expression:?}: {e}"))?;
        info!("Batch reconnect scheduled at {expression:?}");

        let router = self.router.clone();
        let cancel = self.cancel.child_token();
        self.spawn(schedule, cancel, move || {
            let router = router.clone();
            async move {
                router.batch_reconnect().await;
            }
        });
        Ok(())
    }

    /// Schedule a pre-approved action for one destination.
    pub fn schedule_destination_action(
        &self,
        destination: DestinationId,
        expression: &str,
        action: &str,
    ) -> anyhow::Result<()> {
        let schedule = Schedule::from_str(expression)
            .map_err(|e| anyhow::anyhow!("Invalid schedule {expression:?}: {e}"))?;
        let Some(action) = ScheduledAction::parse(action) else {
            anyhow::bail!("Unknown scheduled action {action:?}");
        };
        info!("Destination {destination} scheduled {action:?} at {expression:?}");

        let router = self.router.clone();
        let cancel = self.cancel.child_token();
        self.spawn(schedule, cancel, move || {
            let router = router.clone();
            async move {
                match action {
                    ScheduledAction::Reconnect => {
                        let Some(key) = router.key_for(destination) else {
                            warn!(
                                "Scheduled reconnect for destination {destination} skipped: not subscribed"
                            );
                            return;
                        };
                        if let Err(e) = router.reconnect(&key.source_id, key.room_id).await {
                            error!("Scheduled reconnect of {key} failed: {e}");
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Cancel every scheduled task.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    fn spawn<F, Fut>(&self, schedule: Schedule, cancel: CancellationToken, run: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => run().await,
                }
            }
        });
        self.tasks.lock().push(handle);
    }
}
