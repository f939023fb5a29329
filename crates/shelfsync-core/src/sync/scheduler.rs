//! Background sync task
//!
//! Decides when [`SyncCore::reconcile`] runs:
//! - once at startup, when online with pending mutations
//! - on an offline to online transition, when mutations are pending
//! - on explicit [`SyncCore::request_sync`] calls, ignoring any backoff
//! - every `sync_interval` while online and not backing off
//! - when the retry delay reported by a failed pass elapses
//!
//! With sync disabled in the options only explicit requests run a pass.
//! It also re-evaluates the date-dependent alerts at local midnight.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::events::{PassOutcome, SyncTrigger};
use super::reconciler::SyncCore;

/// Commands sent to the sync task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommand {
    /// Run a pass now
    RequestSync,
    /// Stop the sync task
    Shutdown,
}

/// Handle to control the background sync task
pub struct SyncHandle {
    command_tx: mpsc::UnboundedSender<SyncCommand>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn request_sync(&self) {
        let _ = self.command_tx.send(SyncCommand::RequestSync);
    }

    /// Stop the task after any pass in progress finishes
    pub async fn shutdown(self) {
        let _ = self.command_tx.send(SyncCommand::Shutdown);
        let _ = self.task.await;
    }
}

/// Spawn the background sync task for `core`
///
/// Returns `None` if a task was already spawned for this core.
pub fn spawn_sync_task(core: Arc<SyncCore>) -> Option<SyncHandle> {
    let command_rx = core.take_commands()?;
    let command_tx = core.command_sender();
    let task = tokio::spawn(sync_task_loop(core, command_rx));
    Some(SyncHandle { command_tx, task })
}

/// Main scheduling loop
async fn sync_task_loop(core: Arc<SyncCore>, mut command_rx: mpsc::UnboundedReceiver<SyncCommand>) {
    let period = core.options().sync_interval;
    let automatic = core.options().enabled;
    let mut network_rx = core.network().subscribe();
    let mut online = network_rx.borrow_and_update().is_online();

    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut retry_at: Option<Instant> = None;
    let mut midnight = Instant::now() + until_next_midnight();

    if !automatic {
        info!("Automatic sync disabled, passes run only on request");
    }
    if automatic && online && core.pending_count() > 0 {
        retry_at = run_pass(&core, SyncTrigger::Startup).await;
    }

    loop {
        let deadline = retry_at;
        let retry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(SyncCommand::RequestSync) => {
                        retry_at = run_pass(&core, SyncTrigger::Requested).await;
                    }
                    Some(SyncCommand::Shutdown) | None => break,
                }
            }

            changed = network_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let now_online = network_rx.borrow_and_update().is_online();
                let came_online = now_online && !online;
                online = now_online;

                if automatic && came_online && core.pending_count() > 0 {
                    retry_at = run_pass(&core, SyncTrigger::CameOnline).await;
                }
            }

            _ = ticker.tick() => {
                let backing_off = retry_at.is_some_and(|at| at > Instant::now());
                if automatic && online && !backing_off {
                    retry_at = run_pass(&core, SyncTrigger::Periodic).await;
                }
            }

            _ = retry => {
                retry_at = None;
                if automatic && online {
                    retry_at = run_pass(&core, SyncTrigger::Retry).await;
                }
            }

            _ = tokio::time::sleep_until(midnight) => {
                debug!("Day rollover, refreshing alerts");
                core.roll_day();
                midnight = Instant::now() + until_next_midnight();
            }
        }
    }

    info!("Sync task stopped");
}

/// Run a pass and return when the next retry is due, if any
async fn run_pass(core: &SyncCore, trigger: SyncTrigger) -> Option<Instant> {
    match core.reconcile(trigger).await {
        PassOutcome::Completed(report) => report.retry_after.map(|delay| Instant::now() + delay),
        PassOutcome::Skipped | PassOutcome::Interrupted | PassOutcome::Failed(_) => None,
    }
}

/// Time left until the next local midnight
fn until_next_midnight() -> Duration {
    let now = Local::now();
    now.date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 1))
        .and_then(|next| next.and_local_timezone(Local).earliest())
        .and_then(|next| (next - now).to_std().ok())
        .unwrap_or(Duration::from_secs(3600))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_midnight_is_within_a_day() {
        let wait = until_next_midnight();
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_secs(25 * 3600));
    }
}
