use pkg_metrics::QuotaMetrics;
use pkg_scheduler::{GroupQuotaManager, RecalculationReport};
use pkg_types::config::QuotaEngineConfig;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Re-runs allowed when a pass is superseded by a topology change.
const MAX_SUPERSEDED_RETRIES: usize = 3;

/// Wakes the controller ahead of its next tick, e.g. after a spec change.
#[derive(Clone)]
pub struct QuotaTrigger(Arc<Notify>);

impl QuotaTrigger {
    pub fn trigger(&self) {
        self.0.notify_one();
    }
}

/// Background controller that recomputes quota runtime periodically and on
/// demand, and publishes the results as metrics.
pub struct QuotaRuntimeController {
    manager: Arc<GroupQuotaManager>,
    metrics: Arc<QuotaMetrics>,
    check_interval: Duration,
    wake: Arc<Notify>,
}

impl QuotaRuntimeController {
    pub fn new(
        manager: Arc<GroupQuotaManager>,
        metrics: Arc<QuotaMetrics>,
        check_interval: Duration,
    ) -> Self {
        Self {
            manager,
            metrics,
            check_interval,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Build the controller with the interval from the engine config.
    pub fn from_config(
        manager: Arc<GroupQuotaManager>,
        metrics: Arc<QuotaMetrics>,
        config: &QuotaEngineConfig,
    ) -> Self {
        Self::new(manager, metrics, config.recalculate_interval())
    }

    pub fn trigger_handle(&self) -> QuotaTrigger {
        QuotaTrigger(Arc::clone(&self.wake))
    }

    /// Start the controller loop as a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "QuotaRuntimeController started (interval={}ms)",
                self.check_interval.as_millis()
            );
            let mut interval = tokio::time::interval(self.check_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = self.wake.notified() => {
                        debug!("QuotaRuntimeController triggered");
                    }
                }
                if let Err(e) = self.reconcile() {
                    warn!("QuotaRuntimeController reconcile error: {}", e);
                }
            }
        })
    }

    /// One recalculation, re-run while superseded, then metrics.
    pub fn reconcile(&self) -> anyhow::Result<RecalculationReport> {
        let mut report = self.manager.refresh_runtime()?;
        let mut retries = 0;
        while report.superseded && retries < MAX_SUPERSEDED_RETRIES {
            self.metrics.recalculation_superseded();
            retries += 1;
            report = self.manager.refresh_runtime()?;
        }
        if report.superseded {
            self.metrics.recalculation_superseded();
            warn!(
                "Quota recalculation still superseded after {} retries",
                MAX_SUPERSEDED_RETRIES
            );
            return Ok(report);
        }

        self.metrics.recalculation_completed();
        let snapshots = self.manager.snapshots();
        let names: BTreeSet<String> = snapshots.iter().map(|s| s.name.clone()).collect();
        for snapshot in &snapshots {
            let info = &snapshot.calculate_info;
            self.metrics
                .observe_group(&snapshot.name, &info.request, &info.used, &info.runtime);
        }
        self.metrics.retain_groups(&names);
        Ok(report)
    }
}
