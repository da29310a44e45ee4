use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use pkg_constants::quota::SYSTEM_QUOTA_NAME;
use pkg_types::config::QuotaEngineConfig;
use pkg_types::quota::{QuotaDelta, QuotaGroupSpec};
use pkg_types::resource::ResourceVector;
use pkg_types::validate::{validate_quota_name, validate_quota_spec};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::calculator::{self, PassOutcome};
use crate::error::{QuotaError, Result};
use crate::quota_info::{QuotaInfo, QuotaInfoSnapshot};
use crate::topology::QuotaTopology;

/// Summary of one `refresh_runtime` call.
#[derive(Debug, Clone)]
pub struct RecalculationReport {
    /// Nodes whose runtime was written.
    pub committed: usize,
    /// A newer topology appeared mid-walk; the caller should run again.
    pub superseded: bool,
    pub topology_generation: u64,
    pub duration: Duration,
    pub finished_at: DateTime<Utc>,
}

/// Owns every quota group record and drives recalculation.
///
/// Spec updates and workload deltas may arrive from any thread. Passes are
/// serialized against each other but never block deltas for longer than a
/// single node write.
pub struct GroupQuotaManager {
    quotas: RwLock<HashMap<String, Arc<QuotaInfo>>>,
    cluster_total: Mutex<ResourceVector>,
    /// `None` when the tree must be rebuilt before the next pass.
    topology: Mutex<Option<Arc<QuotaTopology>>>,
    topology_generation: AtomicU64,
    pass_lock: Mutex<()>,
}

impl GroupQuotaManager {
    pub fn new(config: &QuotaEngineConfig) -> Self {
        let system = QuotaInfo::from_spec(&QuotaGroupSpec {
            name: SYSTEM_QUOTA_NAME.to_string(),
            allow_lent_resource: true,
            max: config.system_quota_max.clone(),
            ..Default::default()
        });
        let mut quotas = HashMap::new();
        quotas.insert(SYSTEM_QUOTA_NAME.to_string(), Arc::new(system));

        Self {
            quotas: RwLock::new(quotas),
            cluster_total: Mutex::new(config.cluster_total_resource.clone()),
            topology: Mutex::new(None),
            topology_generation: AtomicU64::new(0),
            pass_lock: Mutex::new(()),
        }
    }

    pub fn update_cluster_total_resource(&self, total: ResourceVector) {
        info!("Cluster total resource set to {}", total);
        *self.cluster_total.lock() = total;
    }

    pub fn cluster_total_resource(&self) -> ResourceVector {
        self.cluster_total.lock().clone()
    }

    /// Create or update a quota group from an observed spec.
    pub fn upsert_quota(&self, spec: &QuotaGroupSpec) -> Result<()> {
        validate_quota_name(&spec.name).map_err(|e| QuotaError::InvalidName {
            name: spec.name.clone(),
            reason: e.to_string(),
        })?;
        validate_quota_spec(spec).map_err(|e| QuotaError::InvalidSpec(e.to_string()))?;

        let (info, created) = match self.quotas.write().entry(spec.name.clone()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let info = Arc::new(QuotaInfo::from_spec(spec));
                entry.insert(Arc::clone(&info));
                (info, true)
            }
        };
        if created {
            info!("Quota {} added under '{}'", spec.name, spec.parent_name);
            self.invalidate_topology();
            return Ok(());
        }

        let was_parent = info.is_parent();
        if info.update_from_remote(spec) {
            if was_parent && !spec.is_parent {
                // Aggregates from its former children are stale.
                info.clear_for_reset();
            }
            debug!("Quota {} moved to parent '{}'", spec.name, spec.parent_name);
            self.invalidate_topology();
        }
        Ok(())
    }

    /// Remove a quota group. The system quota cannot be removed.
    pub fn delete_quota(&self, name: &str) -> Result<()> {
        if name == SYSTEM_QUOTA_NAME {
            return Ok(());
        }
        if self.quotas.write().remove(name).is_none() {
            return Err(QuotaError::QuotaNotFound(name.to_string()));
        }
        info!("Quota {} deleted", name);
        self.invalidate_topology();
        Ok(())
    }

    /// Apply a workload request/used delta to a leaf group.
    pub fn apply_delta(&self, delta: &QuotaDelta) -> Result<()> {
        let info = self
            .quota_info(&delta.quota_name)
            .ok_or_else(|| QuotaError::QuotaNotFound(delta.quota_name.clone()))?;
        info.apply_delta(delta.kind, &delta.resource_delta)
    }

    fn invalidate_topology(&self) {
        *self.topology.lock() = None;
        self.topology_generation.fetch_add(1, Ordering::SeqCst);
    }

    fn current_topology(&self) -> Result<Arc<QuotaTopology>> {
        let mut slot = self.topology.lock();
        if let Some(topology) = slot.as_ref() {
            return Ok(Arc::clone(topology));
        }

        let infos: Vec<Arc<QuotaInfo>> = self.quotas.read().values().cloned().collect();
        let topology = QuotaTopology::build(infos)?;
        for name in topology.top_down_order() {
            if let Some(node) = topology.node(&name)
                && node.quota_info().is_parent()
            {
                node.quota_info().clear_for_reset();
            }
        }
        info!("Quota topology rebuilt ({} groups)", topology.len());

        let topology = Arc::new(topology);
        *slot = Some(Arc::clone(&topology));
        Ok(topology)
    }

    /// Run one recalculation pass over the whole tree.
    ///
    /// Fails only when the current set of groups does not form a tree.
    pub fn refresh_runtime(&self) -> Result<RecalculationReport> {
        let _pass = self.pass_lock.lock();
        let start = Instant::now();
        let generation = self.topology_generation.load(Ordering::SeqCst);

        let topology = match self.current_topology() {
            Ok(t) => t,
            Err(e) => {
                warn!("Quota recalculation skipped: {}", e);
                return Err(e);
            }
        };
        let total = self.cluster_total_resource();

        calculator::aggregate(&topology);
        let outcome = calculator::distribute_tree(&topology, &total, || {
            self.topology_generation.load(Ordering::SeqCst) != generation
        });

        let (committed, superseded) = match outcome {
            PassOutcome::Completed(n) => (n, false),
            PassOutcome::Superseded(n) => {
                warn!(
                    "Quota recalculation superseded after {} nodes (generation {})",
                    n, generation
                );
                (n, true)
            }
        };
        let duration = start.elapsed();
        if !superseded {
            info!(
                "Quota recalculation done: {} groups in {:?}",
                committed, duration
            );
        }
        Ok(RecalculationReport {
            committed,
            superseded,
            topology_generation: generation,
            duration,
            finished_at: Utc::now(),
        })
    }

    fn quota_info(&self, name: &str) -> Option<Arc<QuotaInfo>> {
        self.quotas.read().get(name).cloned()
    }

    pub fn get_runtime(&self, name: &str) -> Option<ResourceVector> {
        self.quota_info(name).map(|i| i.get_runtime())
    }

    pub fn runtime_version(&self, name: &str) -> Option<i64> {
        self.quota_info(name).map(|i| i.runtime_version())
    }

    pub fn quota_snapshot(&self, name: &str) -> Option<QuotaInfoSnapshot> {
        self.quota_info(name).map(|i| i.deep_copy())
    }

    /// Snapshots of every group, sorted by name.
    pub fn snapshots(&self) -> Vec<QuotaInfoSnapshot> {
        let infos: Vec<Arc<QuotaInfo>> = self.quotas.read().values().cloned().collect();
        let mut snapshots: Vec<QuotaInfoSnapshot> = infos.iter().map(|i| i.deep_copy()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn quota_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.quotas.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::quota::DeltaKind;
    use std::sync::Barrier;
    use std::thread;

    fn cpu(v: i64) -> ResourceVector {
        ResourceVector::from([("cpu", v)])
    }

    fn spec(name: &str, parent: &str, is_parent: bool, max: i64, min: i64) -> QuotaGroupSpec {
        QuotaGroupSpec {
            name: name.to_string(),
            parent_name: parent.to_string(),
            is_parent,
            allow_lent_resource: true,
            max: cpu(max),
            min: cpu(min),
            ..Default::default()
        }
    }

    fn request(name: &str, v: i64) -> QuotaDelta {
        QuotaDelta {
            quota_name: name.to_string(),
            resource_delta: cpu(v),
            kind: DeltaKind::Request,
        }
    }

    fn manager(total: i64) -> GroupQuotaManager {
        GroupQuotaManager::new(&QuotaEngineConfig {
            cluster_total_resource: cpu(total),
            ..Default::default()
        })
    }

    #[test]
    fn weighted_split_under_a_parent() {
        let mgr = manager(100);
        mgr.upsert_quota(&spec("team", "", true, 100, 100)).unwrap();
        mgr.upsert_quota(&spec("a", "team", false, 100, 20)).unwrap();
        let mut b = spec("b", "team", false, 100, 0);
        b.shared_weight = cpu(1);
        let mut c = spec("c", "team", false, 100, 0);
        c.shared_weight = cpu(3);
        mgr.upsert_quota(&b).unwrap();
        mgr.upsert_quota(&c).unwrap();
        mgr.upsert_quota(&QuotaGroupSpec {
            shared_weight: cpu(1),
            ..spec("a", "team", false, 100, 20)
        })
        .unwrap();

        mgr.apply_delta(&request("a", 20)).unwrap();
        mgr.apply_delta(&request("b", 100)).unwrap();
        mgr.apply_delta(&request("c", 100)).unwrap();

        let report = mgr.refresh_runtime().unwrap();
        assert!(!report.superseded);
        assert_eq!(mgr.get_runtime("team"), Some(cpu(100)));
        assert_eq!(mgr.get_runtime("a"), Some(cpu(20)));
        assert_eq!(mgr.get_runtime("b"), Some(cpu(20)));
        assert_eq!(mgr.get_runtime("c"), Some(cpu(60)));
    }

    #[test]
    fn missing_parent_is_reported() {
        let mgr = manager(100);
        mgr.upsert_quota(&spec("app", "ghost", false, 10, 0)).unwrap();
        let err = mgr.refresh_runtime().unwrap_err();
        assert!(matches!(err, QuotaError::ParentNotFound { .. }));

        mgr.upsert_quota(&spec("ghost", "", true, 10, 0)).unwrap();
        assert!(mgr.refresh_runtime().is_ok());
    }

    #[test]
    fn invalid_spec_is_rejected() {
        let mgr = manager(100);
        let err = mgr.upsert_quota(&spec("Bad_Name", "", false, 1, 0)).unwrap_err();
        assert!(matches!(err, QuotaError::InvalidName { ref name, .. } if name == "Bad_Name"));

        let err = mgr.upsert_quota(&spec("app", "", false, -1, 0)).unwrap_err();
        assert!(matches!(err, QuotaError::InvalidSpec(_)));
        assert_eq!(mgr.quota_names(), vec![SYSTEM_QUOTA_NAME.to_string()]);
    }

    #[test]
    fn repeated_upsert_keeps_the_same_record() {
        let mgr = manager(100);
        mgr.upsert_quota(&spec("app", "", false, 100, 0)).unwrap();
        mgr.apply_delta(&request("app", 50)).unwrap();
        mgr.upsert_quota(&spec("app", "", false, 80, 0)).unwrap();

        let snap = mgr.quota_snapshot("app").unwrap();
        assert_eq!(snap.calculate_info.request, cpu(50));
        assert_eq!(snap.calculate_info.max, cpu(80));
    }

    #[test]
    fn concurrent_first_upserts_share_one_record() {
        let mgr = Arc::new(manager(1000));
        let barrier = Arc::new(Barrier::new(8));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    mgr.upsert_quota(&spec("app", "", false, 1000, 0)).unwrap();
                    mgr.apply_delta(&request("app", 5)).unwrap();
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        let snap = mgr.quota_snapshot("app").unwrap();
        assert_eq!(snap.calculate_info.request, cpu(40));
    }

    #[test]
    fn system_quota_spec_is_immutable() {
        let mgr = GroupQuotaManager::new(&QuotaEngineConfig {
            cluster_total_resource: cpu(100),
            system_quota_max: cpu(10),
            ..Default::default()
        });
        let before = mgr.quota_snapshot(SYSTEM_QUOTA_NAME).unwrap();
        mgr.upsert_quota(&spec(SYSTEM_QUOTA_NAME, "", true, 500, 500))
            .unwrap();
        assert_eq!(mgr.quota_snapshot(SYSTEM_QUOTA_NAME).unwrap(), before);

        mgr.delete_quota(SYSTEM_QUOTA_NAME).unwrap();
        assert!(mgr.quota_snapshot(SYSTEM_QUOTA_NAME).is_some());
    }

    #[test]
    fn deltas_require_known_leaf() {
        let mgr = manager(100);
        mgr.upsert_quota(&spec("team", "", true, 100, 0)).unwrap();
        assert_eq!(
            mgr.apply_delta(&request("nope", 1)).unwrap_err(),
            QuotaError::QuotaNotFound("nope".to_string())
        );
        assert_eq!(
            mgr.apply_delta(&request("team", 1)).unwrap_err(),
            QuotaError::ParentGroupDelta("team".to_string())
        );
    }

    #[test]
    fn runtime_version_tracks_passes() {
        let mgr = manager(100);
        mgr.upsert_quota(&spec("app", "", false, 50, 0)).unwrap();
        mgr.apply_delta(&request("app", 80)).unwrap();

        mgr.refresh_runtime().unwrap();
        let runtime = mgr.get_runtime("app").unwrap();
        let version = mgr.runtime_version("app").unwrap();
        assert_eq!(runtime, cpu(50));

        mgr.refresh_runtime().unwrap();
        assert_eq!(mgr.get_runtime("app").unwrap(), runtime);
        assert_eq!(mgr.runtime_version("app").unwrap(), version + 1);
    }

    #[test]
    fn reparenting_resets_derived_state() {
        let mgr = manager(100);
        mgr.upsert_quota(&spec("team-a", "", true, 100, 0)).unwrap();
        mgr.upsert_quota(&spec("team-b", "", true, 100, 0)).unwrap();
        mgr.upsert_quota(&spec("app", "team-a", false, 100, 0)).unwrap();
        mgr.apply_delta(&request("app", 30)).unwrap();
        mgr.refresh_runtime().unwrap();
        assert_eq!(mgr.get_runtime("team-a"), Some(cpu(30)));

        mgr.upsert_quota(&spec("app", "team-b", false, 100, 0)).unwrap();
        mgr.refresh_runtime().unwrap();
        assert_eq!(mgr.get_runtime("team-a"), Some(cpu(0)));
        assert_eq!(mgr.get_runtime("team-b"), Some(cpu(30)));
        // leaf request survives the rebuild
        assert_eq!(mgr.get_runtime("app"), Some(cpu(30)));
    }

    #[test]
    fn non_lending_minimum_recovers_with_capacity() {
        let mgr = manager(100);
        mgr.upsert_quota(&spec("team", "", true, 200, 0)).unwrap();
        for name in ["a", "b"] {
            mgr.upsert_quota(&QuotaGroupSpec {
                allow_lent_resource: false,
                ..spec(name, "team", false, 100, 80)
            })
            .unwrap();
        }

        mgr.refresh_runtime().unwrap();
        assert_eq!(mgr.get_runtime("team"), Some(cpu(100)));
        assert_eq!(mgr.get_runtime("a"), Some(cpu(50)));
        assert_eq!(mgr.get_runtime("b"), Some(cpu(50)));

        mgr.update_cluster_total_resource(cpu(200));
        mgr.refresh_runtime().unwrap();
        assert_eq!(mgr.get_runtime("team"), Some(cpu(160)));
        assert_eq!(mgr.get_runtime("a"), Some(cpu(80)));
        assert_eq!(mgr.get_runtime("b"), Some(cpu(80)));
    }

    #[test]
    fn deleted_group_disappears() {
        let mgr = manager(100);
        mgr.upsert_quota(&spec("app", "", false, 100, 0)).unwrap();
        mgr.delete_quota("app").unwrap();
        assert!(mgr.get_runtime("app").is_none());
        assert_eq!(
            mgr.delete_quota("app").unwrap_err(),
            QuotaError::QuotaNotFound("app".to_string())
        );
        assert!(mgr.refresh_runtime().is_ok());
    }

    #[test]
    fn concurrent_deltas_and_passes() {
        let mgr = Arc::new(manager(1000));
        mgr.upsert_quota(&spec("team", "", true, 1000, 0)).unwrap();
        for i in 0..4 {
            mgr.upsert_quota(&spec(&format!("app-{}", i), "team", false, 1000, 0))
                .unwrap();
        }

        let workers: Vec<_> = (0..4)
            .map(|i| {
                let mgr = Arc::clone(&mgr);
                thread::spawn(move || {
                    let name = format!("app-{}", i);
                    for _ in 0..100 {
                        mgr.apply_delta(&request(&name, 2)).unwrap();
                        mgr.apply_delta(&request(&name, -1)).unwrap();
                    }
                })
            })
            .collect();
        let recalc = {
            let mgr = Arc::clone(&mgr);
            thread::spawn(move || {
                for _ in 0..20 {
                    mgr.refresh_runtime().unwrap();
                }
            })
        };
        for w in workers {
            w.join().unwrap();
        }
        recalc.join().unwrap();

        mgr.refresh_runtime().unwrap();
        for i in 0..4 {
            let name = format!("app-{}", i);
            assert_eq!(mgr.quota_snapshot(&name).unwrap().calculate_info.request, cpu(100));
            assert_eq!(mgr.get_runtime(&name), Some(cpu(100)));
        }
        assert_eq!(mgr.get_runtime("team"), Some(cpu(400)));
    }
}
