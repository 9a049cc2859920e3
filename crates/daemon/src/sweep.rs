//! Health sweep
//!
//! Periodically inspects the containers of every managed lab and, when
//! auto-recovery is enabled, restarts labs whose containers are gone or not
//! running.

use crate::controller::{LabController, RecoveryOutcome};
use crate::runtime::RuntimeClient;
use cyberlab_common::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tally of one sweep cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub recovered: usize,
    pub failed: usize,
    /// Labs held by another lifecycle operation
    pub skipped: usize,
    /// Labs whose health could not be determined
    pub errors: usize,
}

pub struct HealthSweep {
    controller: Arc<LabController>,
    interval: Duration,
}

/// Running sweep task
pub struct SweepHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl SweepHandle {
    /// Stop the sweep and wait for an in-flight cycle to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            warn!("Health sweep task ended abnormally: {}", e);
        }
    }
}

impl HealthSweep {
    pub fn new(controller: Arc<LabController>, interval: Duration) -> Self {
        Self { controller, interval }
    }

    pub fn spawn(self) -> SweepHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let join = tokio::spawn(async move { self.run(token).await });
        SweepHandle { cancel, join }
    }

    /// Run cycles until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "Health sweep started (every {:?}, auto-recovery {})",
            self.interval,
            if self.controller.options().auto_recovery { "on" } else { "off" }
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep_once().await;
                    if report.checked > 0 {
                        debug!("Health sweep: {:?}", report);
                    }
                }
            }
        }

        info!("Health sweep stopped");
    }

    /// Check every managed lab once
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for entry in self.controller.active_labs() {
            if self.controller.is_busy(entry.lab_id) {
                report.skipped += 1;
                continue;
            }
            report.checked += 1;
            if entry.container_ids.is_empty() {
                warn!("Lab {} ({}) has no tracked containers", entry.lab_name, entry.lab_id);
            }

            let healthy = match check_containers_health(self.controller.runtime().as_ref(), &entry.container_ids).await {
                Ok(healthy) => healthy,
                Err(e) => {
                    warn!("Health check for lab {} failed: {}", entry.lab_id, e);
                    report.errors += 1;
                    continue;
                }
            };

            if healthy {
                report.healthy += 1;
                self.controller.set_healthy(entry.lab_id, true);
                continue;
            }

            report.unhealthy += 1;
            if !self.controller.options().auto_recovery {
                warn!("Lab {} ({}) is unhealthy", entry.lab_name, entry.lab_id);
                self.controller.set_healthy(entry.lab_id, false);
                continue;
            }

            warn!("Lab {} ({}) is unhealthy, recovering", entry.lab_name, entry.lab_id);
            match self.controller.recover_lab(entry.lab_id).await {
                RecoveryOutcome::Recovered => report.recovered += 1,
                RecoveryOutcome::Failed(_) => report.failed += 1,
                RecoveryOutcome::Skipped => report.skipped += 1,
            }
        }

        report
    }
}

/// True when the lab has containers and every one exists and is running
pub async fn check_containers_health(runtime: &dyn RuntimeClient, container_ids: &[String]) -> Result<bool> {
    if container_ids.is_empty() {
        return Ok(false);
    }
    for id in container_ids {
        match runtime.inspect(id).await? {
            Some(detail) if detail.state.is_running() => {}
            Some(detail) => {
                debug!("Container {} is {}", id, detail.state.status);
                return Ok(false);
            }
            None => {
                debug!("Container {} is gone", id);
                return Ok(false);
            }
        }
    }
    Ok(true)
}
