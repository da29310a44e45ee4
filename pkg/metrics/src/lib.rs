use parking_lot::RwLock;
use pkg_types::resource::ResourceVector;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

pub const QUOTA_RUNTIME: &str = "quota_runtime";
pub const QUOTA_REQUEST: &str = "quota_request";
pub const QUOTA_USED: &str = "quota_used";
pub const RECALCULATIONS_TOTAL: &str = "quota_recalculations_total";
pub const RECALCULATIONS_SUPERSEDED_TOTAL: &str = "quota_recalculations_superseded_total";

/// Quota engine metrics, rendered in Prometheus text exposition format.
///
/// Gauges are keyed by `(quota, resource)`; counters are plain.
pub struct QuotaMetrics {
    recalculations: AtomicU64,
    superseded: AtomicU64,
    gauges: RwLock<BTreeMap<&'static str, BTreeMap<(String, String), i64>>>,
}

fn help(metric: &str) -> &'static str {
    match metric {
        QUOTA_RUNTIME => "Current runtime entitlement of the quota group",
        QUOTA_REQUEST => "Aggregated request of the quota group",
        QUOTA_USED => "Aggregated usage of the quota group",
        RECALCULATIONS_TOTAL => "Completed runtime recalculation passes",
        RECALCULATIONS_SUPERSEDED_TOTAL => "Recalculation passes abandoned for a newer topology",
        _ => "",
    }
}

impl QuotaMetrics {
    pub fn new() -> Self {
        let mut gauges = BTreeMap::new();
        for metric in [QUOTA_REQUEST, QUOTA_RUNTIME, QUOTA_USED] {
            gauges.insert(metric, BTreeMap::new());
        }
        Self {
            recalculations: AtomicU64::new(0),
            superseded: AtomicU64::new(0),
            gauges: RwLock::new(gauges),
        }
    }

    pub fn recalculation_completed(&self) {
        self.recalculations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recalculation_superseded(&self) {
        self.superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recalculations(&self) -> u64 {
        self.recalculations.load(Ordering::Relaxed)
    }

    /// Replace the gauges of one quota group.
    pub fn observe_group(
        &self,
        quota: &str,
        request: &ResourceVector,
        used: &ResourceVector,
        runtime: &ResourceVector,
    ) {
        let mut gauges = self.gauges.write();
        for (metric, values) in [
            (QUOTA_REQUEST, request),
            (QUOTA_USED, used),
            (QUOTA_RUNTIME, runtime),
        ] {
            let series = gauges.entry(metric).or_default();
            series.retain(|(q, _), _| q != quota);
            for (resource, value) in values.iter() {
                series.insert((quota.to_string(), resource.to_string()), value);
            }
        }
    }

    /// Drop series of groups that no longer exist.
    pub fn retain_groups(&self, quotas: &BTreeSet<String>) {
        let mut gauges = self.gauges.write();
        for series in gauges.values_mut() {
            series.retain(|(q, _), _| quotas.contains(q));
        }
    }

    pub fn gauge(&self, metric: &str, quota: &str, resource: &str) -> Option<i64> {
        let gauges = self.gauges.read();
        gauges
            .get(metric)?
            .get(&(quota.to_string(), resource.to_string()))
            .copied()
    }

    pub fn render(&self) -> String {
        let mut output = String::new();

        for (name, value) in [
            (RECALCULATIONS_TOTAL, self.recalculations.load(Ordering::Relaxed)),
            (
                RECALCULATIONS_SUPERSEDED_TOTAL,
                self.superseded.load(Ordering::Relaxed),
            ),
        ] {
            output.push_str(&format!("# HELP {} {}\n", name, help(name)));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n", name, value));
        }

        let gauges = self.gauges.read();
        for (name, series) in gauges.iter() {
            output.push_str(&format!("# HELP {} {}\n", name, help(name)));
            output.push_str(&format!("# TYPE {} gauge\n", name));
            for ((quota, resource), value) in series {
                output.push_str(&format!(
                    "{}{{quota=\"{}\",resource=\"{}\"}} {}\n",
                    name, quota, resource, value
                ));
            }
        }

        output
    }
}

impl Default for QuotaMetrics {
    fn default() -> Self {
        Self::new()
    }
}
