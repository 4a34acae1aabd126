//! Sync scheduler — one paced pass over the fleet per 24h epoch
//!
//! Remote panels rate-limit aggressively, so the fleet is never burst-
//! polled: the scheduler spreads the remaining hosts evenly across what
//! is left of a ~23.5h budget, with jitter so the traffic never looks
//! mechanical. Progress (epoch start + cursor) is persisted after every
//! host, which makes the loop restart-safe — a crash mid-epoch resumes
//! where it stopped instead of hammering every host again from zero.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cache::NodeCache;
use crate::config::FleetConfig;
use crate::hosts::HostRegistry;
use crate::monitor::now_secs;

/// Process-wide sync position, persisted to `sync_progress.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncProgress {
    #[serde(default)]
    pub epoch_start: u64,
    #[serde(default)]
    pub cursor: usize,
}

impl SyncProgress {
    fn path(data_dir: &std::path::Path) -> PathBuf {
        data_dir.join("sync_progress.json")
    }

    pub fn load(data_dir: &std::path::Path) -> Self {
        crate::store::load_json_or_default(&Self::path(data_dir))
    }

    pub fn save(&self, data_dir: &std::path::Path) {
        crate::store::save_json_logged(&Self::path(data_dir), self);
    }
}

/// A fresh epoch is due when the old one expired, never ran, or already
/// walked past the end of the host list.
fn needs_reset(progress: &SyncProgress, now: u64, host_count: usize, epoch_secs: u64) -> bool {
    progress.epoch_start == 0
        || now.saturating_sub(progress.epoch_start) > epoch_secs
        || progress.cursor >= host_count
}

/// Delay before the next host: spread what is left of the budget over the
/// hosts still to go, minus the time this step already took. Clamped to
/// at least 1s and never past the remaining budget.
fn pace_delay_with_jitter(
    hosts_left: usize,
    elapsed_secs: u64,
    target_secs: u64,
    step_secs: f64,
    jitter: f64,
) -> Duration {
    if hosts_left == 0 {
        return Duration::ZERO;
    }
    let time_left = target_secs as f64 - elapsed_secs as f64;
    if time_left <= 0.0 {
        return Duration::from_secs(1);
    }
    let base = time_left / hosts_left as f64;
    let delay = (base * jitter - step_secs).max(1.0).min(time_left);
    Duration::from_secs_f64(delay)
}

fn pace_delay(hosts_left: usize, elapsed_secs: u64, target_secs: u64, step_secs: f64) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.9..=1.1);
    pace_delay_with_jitter(hosts_left, elapsed_secs, target_secs, step_secs, jitter)
}

pub struct SyncScheduler {
    registry: Arc<HostRegistry>,
    cache: Arc<NodeCache>,
    data_dir: PathBuf,
    config: FleetConfig,
}

impl SyncScheduler {
    pub fn new(
        registry: Arc<HostRegistry>,
        cache: Arc<NodeCache>,
        data_dir: PathBuf,
        config: FleetConfig,
    ) -> Self {
        Self {
            registry,
            cache,
            data_dir,
            config,
        }
    }

    /// Load progress and reset it if the epoch is spent; the reset is
    /// persisted immediately so a crash right after still starts clean.
    fn prepare_epoch(&self, now: u64) -> SyncProgress {
        let progress = SyncProgress::load(&self.data_dir);
        if needs_reset(&progress, now, self.registry.len(), self.config.sync_epoch_secs) {
            let fresh = SyncProgress {
                epoch_start: now,
                cursor: 0,
            };
            fresh.save(&self.data_dir);
            info!("Starting a fresh sync epoch over {} hosts", self.registry.len());
            fresh
        } else {
            info!(
                "Resuming sync epoch at host {}/{}",
                progress.cursor + 1,
                self.registry.len()
            );
            progress
        }
    }

    /// Walk the host list from the cursor to the end. Returns false when
    /// the shutdown signal stopped the walk at a host boundary.
    async fn run_epoch(
        &self,
        progress: &mut SyncProgress,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        while progress.cursor < self.registry.len() {
            if *shutdown.borrow() {
                info!("Shutdown requested, stopping sync at host boundary {}", progress.cursor);
                return false;
            }

            let Some(host) = self.registry.at(progress.cursor) else {
                break;
            };

            // Heartbeat hosts refresh themselves by push — never pulled here
            if host.heartbeat_capable {
                progress.cursor += 1;
                progress.save(&self.data_dir);
                continue;
            }

            let step_started = std::time::Instant::now();
            let result = self.cache.refresh(&host.endpoint).await;

            progress.cursor += 1;
            progress.save(&self.data_dir);

            let delay = match result {
                Ok(_) => {
                    let hosts_left = self.registry.len().saturating_sub(progress.cursor);
                    pace_delay(
                        hosts_left,
                        now_secs().saturating_sub(progress.epoch_start),
                        self.config.sync_target_secs,
                        step_started.elapsed().as_secs_f64(),
                    )
                }
                Err(e) => {
                    warn!("Sync of {} failed ({}), backing off", host.endpoint, e);
                    Duration::from_secs(self.config.sync_error_backoff_secs)
                }
            };

            if !sleep_or_shutdown(delay, shutdown).await {
                info!("Shutdown requested during pacing sleep");
                return false;
            }
        }
        true
    }

    /// The perpetual loop: one iteration per epoch, then sleep out
    /// whatever is left of the 24h window.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let mut progress = self.prepare_epoch(now_secs());
            if !self.run_epoch(&mut progress, &mut shutdown).await {
                return;
            }

            self.cache.flush();
            info!("Sync epoch complete ({} hosts)", progress.cursor);

            let elapsed = now_secs().saturating_sub(progress.epoch_start);
            let wait = self.config.sync_epoch_secs.saturating_sub(elapsed).max(60);
            if !sleep_or_shutdown(Duration::from_secs(wait), &mut shutdown).await {
                return;
            }
        }
    }
}

/// Sleep, but wake early on shutdown. Returns false when shut down.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if delay.is_zero() {
        return !*shutdown.borrow();
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown.changed() => match changed {
            Ok(()) => !*shutdown.borrow(),
            // sender gone: the process is coming down
            Err(_) => false,
        },
    }
}
