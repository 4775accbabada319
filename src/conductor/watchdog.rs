//! Build watchdog — a per-build supervisor that observes progress and
//! force-fails genuine stalls.
//!
//! The watchdog shares only the conductor's monotonic progress counter;
//! it observes, it does not manipulate build state. Every heartbeat it
//! emits a health line. Past the warn threshold it warns; past the fail
//! threshold it flags the stall and fires the build's cancellation token
//! — EXCEPT while an IDE-ready or plan-review gate is open, which is
//! user think-time, not a stall.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::WatchdogConfig;
use crate::conductor::{BuildHandle, GateKind};
use crate::events::{Broadcaster, BuildEvent};
use crate::store::BuildStore;

pub fn spawn_watchdog(
    handle: Arc<BuildHandle>,
    broadcaster: Arc<dyn Broadcaster>,
    store: Arc<dyn BuildStore>,
    config: WatchdogConfig,
    build_id: Uuid,
    user_id: Uuid,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(config.heartbeat_secs)) => {}
                _ = handle.cancel_token().cancelled() => break,
            }

            let mut idle = handle.idle_seconds();
            let activity = handle.activity().await;
            let status = if activity.is_empty() {
                "processing".to_string()
            } else {
                activity
            };

            if idle >= config.stall_fail_secs {
                // User think-time gates never count as stalls.
                if handle.gate_open(GateKind::IdeReady).await
                    || handle.gate_open(GateKind::PlanReview).await
                {
                    handle.touch_progress();
                    idle = 0;
                } else {
                    let message = format!(
                        "Health: build stalled — no progress for {idle}s while {status}. Force-failing."
                    );
                    let _ = store.append_log(build_id, &message, "health", "error").await;
                    broadcaster
                        .send(
                            user_id,
                            BuildEvent::BuildLog {
                                message,
                                source: "health".into(),
                                level: "error".into(),
                            },
                        )
                        .await;
                    handle.flag_stall(idle, &status);
                    break;
                }
            }

            let (message, level) = if idle >= config.stall_warn_secs {
                (
                    format!(
                        "Health: {status} — no progress for {idle}s (force-fail at {}s)",
                        config.stall_fail_secs
                    ),
                    "warn",
                )
            } else {
                let elapsed = if idle >= 60 {
                    format!("{}m{}s", idle / 60, idle % 60)
                } else {
                    format!("{idle}s")
                };
                (
                    format!("Health: {status} — {elapsed} since last progress"),
                    "info",
                )
            };

            let _ = store.append_log(build_id, &message, "health", level).await;
            broadcaster
                .send(
                    user_id,
                    BuildEvent::BuildLog {
                        message,
                        source: "health".into(),
                        level: level.into(),
                    },
                )
                .await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelBroadcaster;
    use crate::store::MemoryBuildStore;

    fn fast_config() -> WatchdogConfig {
        WatchdogConfig {
            heartbeat_secs: 1,
            stall_warn_secs: 2,
            stall_fail_secs: 3,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_flags_and_cancels() {
        let handle = Arc::new(BuildHandle::new(Uuid::new_v4(), Uuid::new_v4()));
        let broadcaster = Arc::new(ChannelBroadcaster::new());
        let store = Arc::new(MemoryBuildStore::new());
        let build_id = Uuid::new_v4();

        let task = spawn_watchdog(
            handle.clone(),
            broadcaster,
            store,
            fast_config(),
            build_id,
            Uuid::new_v4(),
        );

        // No progress touches — the watchdog must trip.
        tokio::time::timeout(Duration::from_secs(60), task)
            .await
            .expect("watchdog should exit")
            .unwrap();
        assert!(handle.stalled());
        assert!(handle.cancel_token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_plan_gate_exempts_stall() {
        let handle = Arc::new(BuildHandle::new(Uuid::new_v4(), Uuid::new_v4()));
        let broadcaster = Arc::new(ChannelBroadcaster::new());
        let store = Arc::new(MemoryBuildStore::new());

        // A plan-review gate is open the whole time.
        let _rx = handle.open_gate(GateKind::PlanReview).await;

        let task = spawn_watchdog(
            handle.clone(),
            broadcaster,
            store,
            fast_config(),
            Uuid::new_v4(),
            Uuid::new_v4(),
        );

        // Let several fail-windows elapse, then stop the build normally.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!handle.stalled(), "gate wait must not count as a stall");
        handle.cancel();
        let _ = task.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_resets_stall_clock() {
        let handle = Arc::new(BuildHandle::new(Uuid::new_v4(), Uuid::new_v4()));
        let broadcaster = Arc::new(ChannelBroadcaster::new());
        let store = Arc::new(MemoryBuildStore::new());

        let task = spawn_watchdog(
            handle.clone(),
            broadcaster,
            store,
            fast_config(),
            Uuid::new_v4(),
            Uuid::new_v4(),
        );

        // Touch progress faster than the fail window for a while.
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            handle.touch_progress();
        }
        assert!(!handle.stalled());
        handle.cancel();
        let _ = task.await;
    }
}
