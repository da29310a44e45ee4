use parking_lot::{Mutex, MutexGuard};
use pkg_constants::quota::SYSTEM_QUOTA_NAME;
use pkg_types::quota::{DeltaKind, QuotaGroupSpec};
use pkg_types::resource::ResourceVector;
use serde::{Deserialize, Serialize};

use crate::error::{QuotaError, Result};

/// Quantitative state of one quota group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaCalculateInfo {
    /// Upper limit; runtime never exceeds it.
    pub max: ResourceVector,
    /// Guarantee as declared.
    pub original_min: ResourceVector,
    /// Guarantee honored this cycle, scaled down when siblings' minimums
    /// overflow the parent's capacity.
    pub auto_scale_min: ResourceVector,
    /// Consumed by admitted workloads.
    pub used: ResourceVector,
    /// Demanded by pending and running workloads.
    pub request: ResourceVector,
    /// Competition weight for capacity beyond guarantees.
    pub shared_weight: ResourceVector,
    /// Current entitlement.
    pub runtime: ResourceVector,
}

/// Lock-protected part of a [`QuotaInfo`].
///
/// Methods here assume the owning node's lock is held; they are only
/// reachable through [`QuotaInfo::lock`].
#[derive(Debug, Clone, Default)]
pub(crate) struct QuotaState {
    pub(crate) parent_name: String,
    pub(crate) is_parent: bool,
    pub(crate) allow_lent_resource: bool,
    pub(crate) runtime_version: i64,
    pub(crate) calculate_info: QuotaCalculateInfo,
}

impl QuotaState {
    pub(crate) fn add_request_non_negative(&mut self, delta: &ResourceVector) {
        let info = &mut self.calculate_info;
        info.request = info.request.add(delta);
        info.request.clamp_negative_to_zero();
    }

    pub(crate) fn add_used_non_negative(&mut self, delta: &ResourceVector) {
        let info = &mut self.calculate_info;
        info.used = info.used.add(delta);
        info.used.clamp_negative_to_zero();
    }

    /// Request capped at Max. A child passing more than its own Max upwards
    /// would claim parent capacity it can never use.
    pub(crate) fn limit_request(&self) -> ResourceVector {
        self.calculate_info
            .request
            .min_per_key(&self.calculate_info.max)
    }

    /// What this group contributes to its parent's request. Groups that do
    /// not lend keep their whole declared guarantee reserved; the scaled
    /// minimum is derived from the parent runtime this value feeds.
    pub(crate) fn request_for_parent(&self) -> ResourceVector {
        let limited = self.limit_request();
        if self.allow_lent_resource {
            return limited;
        }
        limited
            .max_per_key(&self.calculate_info.original_min)
            .min_per_key(&self.calculate_info.max)
    }

    pub(crate) fn masked_runtime(&self) -> ResourceVector {
        self.calculate_info
            .runtime
            .mask(&self.calculate_info.max.resource_names())
    }

    pub(crate) fn set_auto_scale_min(&mut self, min: ResourceVector) {
        self.calculate_info.auto_scale_min = min;
    }

    /// Store a freshly computed runtime, restricted to declared resources.
    pub(crate) fn commit_runtime(&mut self, runtime: ResourceVector) {
        self.calculate_info.runtime = runtime;
        self.calculate_info.runtime = self.masked_runtime();
        self.runtime_version += 1;
    }

    pub(crate) fn set_aggregates(&mut self, request: ResourceVector, used: ResourceVector) {
        self.calculate_info.request = request;
        self.calculate_info.used = used;
    }

    pub(crate) fn clear_for_reset(&mut self) {
        self.calculate_info.request = ResourceVector::new();
        self.calculate_info.used = ResourceVector::new();
        self.calculate_info.runtime = ResourceVector::new();
        self.runtime_version = 0;
    }
}

/// Per-group quota record shared between the manager, the topology and the
/// recalculation engine.
///
/// Every read copies out under the node's own lock. No method here touches
/// more than one `QuotaInfo`, so no caller ever needs two node locks at once.
#[derive(Debug)]
pub struct QuotaInfo {
    name: String,
    state: Mutex<QuotaState>,
}

/// Point-in-time copy of a [`QuotaInfo`], safe to hand to other threads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaInfoSnapshot {
    pub name: String,
    pub parent_name: String,
    pub is_parent: bool,
    pub runtime_version: i64,
    pub allow_lent_resource: bool,
    pub calculate_info: QuotaCalculateInfo,
}

impl QuotaInfo {
    pub fn new(is_parent: bool, allow_lent_resource: bool, name: &str, parent_name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(QuotaState {
                parent_name: parent_name.to_string(),
                is_parent,
                allow_lent_resource,
                runtime_version: 0,
                calculate_info: QuotaCalculateInfo::default(),
            }),
        }
    }

    /// Build the local record for a newly observed quota group.
    pub fn from_spec(spec: &QuotaGroupSpec) -> Self {
        let info = Self::new(
            spec.is_parent,
            spec.allow_lent_resource,
            &spec.name,
            &spec.parent_name,
        );
        {
            let mut state = info.state.lock();
            state.calculate_info.max = spec.max.clone();
            state.calculate_info.original_min = spec.min.clone();
            state.calculate_info.shared_weight = spec.effective_shared_weight();
        }
        info
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, QuotaState> {
        self.state.lock()
    }

    /// Apply a changed spec: max, min, shared weight, lending, role and
    /// parent. Request, used and runtime are untouched. The reserved system
    /// quota is never overridden.
    ///
    /// Returns true when the group's position in the tree changed.
    pub fn update_from_remote(&self, remote: &QuotaGroupSpec) -> bool {
        if remote.name == SYSTEM_QUOTA_NAME || self.name == SYSTEM_QUOTA_NAME {
            return false;
        }
        let mut state = self.state.lock();
        let moved = state.parent_name != remote.parent_name || state.is_parent != remote.is_parent;

        state.calculate_info.max = remote.max.clone();
        state.calculate_info.original_min = remote.min.clone();
        state.calculate_info.shared_weight = remote.effective_shared_weight();
        state.allow_lent_resource = remote.allow_lent_resource;
        state.is_parent = remote.is_parent;
        state.parent_name = remote.parent_name.clone();
        moved
    }

    /// Apply a workload delta, clamping each component at zero.
    pub fn apply_delta(&self, kind: DeltaKind, delta: &ResourceVector) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_parent {
            return Err(QuotaError::ParentGroupDelta(self.name.clone()));
        }
        match kind {
            DeltaKind::Request => state.add_request_non_negative(delta),
            DeltaKind::Used => state.add_used_non_negative(delta),
        }
        Ok(())
    }

    pub fn get_request(&self) -> ResourceVector {
        self.state.lock().calculate_info.request.clone()
    }

    pub fn get_used(&self) -> ResourceVector {
        self.state.lock().calculate_info.used.clone()
    }

    pub fn get_runtime(&self) -> ResourceVector {
        self.state.lock().calculate_info.runtime.clone()
    }

    pub fn get_max(&self) -> ResourceVector {
        self.state.lock().calculate_info.max.clone()
    }

    pub fn get_auto_scale_min(&self) -> ResourceVector {
        self.state.lock().calculate_info.auto_scale_min.clone()
    }

    pub fn get_limit_request(&self) -> ResourceVector {
        self.state.lock().limit_request()
    }

    pub fn runtime_version(&self) -> i64 {
        self.state.lock().runtime_version
    }

    pub fn parent_name(&self) -> String {
        self.state.lock().parent_name.clone()
    }

    pub fn is_parent(&self) -> bool {
        self.state.lock().is_parent
    }

    pub fn clear_for_reset(&self) {
        self.state.lock().clear_for_reset();
    }

    pub fn deep_copy(&self) -> QuotaInfoSnapshot {
        let state = self.state.lock();
        QuotaInfoSnapshot {
            name: self.name.clone(),
            parent_name: state.parent_name.clone(),
            is_parent: state.is_parent,
            runtime_version: state.runtime_version,
            allow_lent_resource: state.allow_lent_resource,
            calculate_info: state.calculate_info.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, max: i64, min: i64) -> QuotaGroupSpec {
        QuotaGroupSpec {
            name: name.to_string(),
            parent_name: "team".to_string(),
            allow_lent_resource: true,
            max: ResourceVector::from([("cpu", max), ("memory", max * 10)]),
            min: ResourceVector::from([("cpu", min)]),
            ..Default::default()
        }
    }

    #[test]
    fn from_spec_defaults_shared_weight_to_max() {
        let info = QuotaInfo::from_spec(&spec("app", 100, 20));
        let snap = info.deep_copy();
        assert_eq!(snap.calculate_info.shared_weight, snap.calculate_info.max);
        assert_eq!(snap.parent_name, "team");
        assert_eq!(snap.runtime_version, 0);
    }

    #[test]
    fn update_from_remote_replaces_spec_fields_only() {
        let info = QuotaInfo::from_spec(&spec("app", 100, 20));
        info.apply_delta(DeltaKind::Request, &ResourceVector::from([("cpu", 30)]))
            .unwrap();
        info.lock().commit_runtime(ResourceVector::from([("cpu", 25)]));

        let mut remote = spec("app", 200, 50);
        remote.shared_weight = ResourceVector::from([("cpu", 3)]);
        remote.allow_lent_resource = false;
        assert!(!info.update_from_remote(&remote));

        let snap = info.deep_copy();
        assert_eq!(snap.calculate_info.max.get("cpu"), 200);
        assert_eq!(snap.calculate_info.original_min.get("cpu"), 50);
        assert_eq!(snap.calculate_info.shared_weight.get("cpu"), 3);
        assert!(!snap.allow_lent_resource);
        assert_eq!(snap.calculate_info.request.get("cpu"), 30);
        assert_eq!(snap.calculate_info.runtime.get("cpu"), 25);
        assert_eq!(snap.runtime_version, 1);
    }

    #[test]
    fn update_from_remote_reports_reparenting() {
        let info = QuotaInfo::from_spec(&spec("app", 100, 20));
        let mut remote = spec("app", 100, 20);
        remote.parent_name = "other-team".to_string();
        assert!(info.update_from_remote(&remote));
        assert_eq!(info.parent_name(), "other-team");
    }

    #[test]
    fn system_quota_ignores_remote_updates() {
        let mut system = spec(SYSTEM_QUOTA_NAME, 10, 0);
        system.parent_name = String::new();
        let info = QuotaInfo::from_spec(&system);
        let before = info.deep_copy();

        let mut remote = spec(SYSTEM_QUOTA_NAME, 999, 999);
        remote.is_parent = true;
        remote.allow_lent_resource = false;
        assert!(!info.update_from_remote(&remote));
        assert_eq!(info.deep_copy(), before);
    }

    #[test]
    fn huge_deltas_saturate_instead_of_wrapping() {
        let info = QuotaInfo::from_spec(&spec("app", 100, 0));
        let delta = ResourceVector::from([("memory", i64::MAX / 2 + 10)]);
        info.apply_delta(DeltaKind::Request, &delta).unwrap();
        info.apply_delta(DeltaKind::Request, &delta).unwrap();
        assert_eq!(info.get_request().get("memory"), i64::MAX);

        info.apply_delta(DeltaKind::Used, &delta).unwrap();
        info.apply_delta(DeltaKind::Used, &delta).unwrap();
        assert_eq!(info.get_used().get("memory"), i64::MAX);
    }

    #[test]
    fn negative_delta_clamps_to_zero() {
        let info = QuotaInfo::from_spec(&spec("app", 100, 20));
        info.apply_delta(DeltaKind::Used, &ResourceVector::from([("cpu", 10)]))
            .unwrap();
        info.apply_delta(DeltaKind::Used, &ResourceVector::from([("cpu", -25), ("gpu", -1)]))
            .unwrap();
        let used = info.get_used();
        assert_eq!(used.quantity("cpu"), Some(0));
        assert_eq!(used.quantity("gpu"), Some(0));
        assert!(used.is_negative().is_empty());

        info.apply_delta(DeltaKind::Request, &ResourceVector::from([("cpu", -1)]))
            .unwrap();
        assert_eq!(info.get_request().quantity("cpu"), Some(0));
    }

    #[test]
    fn parent_groups_reject_deltas() {
        let mut parent = spec("team", 100, 0);
        parent.is_parent = true;
        let info = QuotaInfo::from_spec(&parent);
        let err = info
            .apply_delta(DeltaKind::Request, &ResourceVector::from([("cpu", 1)]))
            .unwrap_err();
        assert_eq!(err, QuotaError::ParentGroupDelta("team".to_string()));
    }

    #[test]
    fn limit_request_caps_at_max() {
        let info = QuotaInfo::from_spec(&spec("app", 10, 0));
        info.apply_delta(
            DeltaKind::Request,
            &ResourceVector::from([("cpu", 30), ("gpu", 4)]),
        )
        .unwrap();
        let limited = info.get_limit_request();
        assert_eq!(limited.get("cpu"), 10);
        // no declared max for gpu: passed through
        assert_eq!(limited.get("gpu"), 4);
    }

    #[test]
    fn non_lending_group_reserves_its_min_upwards() {
        let mut s = spec("app", 100, 40);
        s.allow_lent_resource = false;
        let info = QuotaInfo::from_spec(&s);
        info.apply_delta(DeltaKind::Request, &ResourceVector::from([("cpu", 10)]))
            .unwrap();
        assert_eq!(info.lock().request_for_parent().get("cpu"), 40);
    }

    #[test]
    fn commit_masks_runtime_and_bumps_version() {
        let info = QuotaInfo::from_spec(&spec("app", 100, 20));
        info.lock()
            .commit_runtime(ResourceVector::from([("cpu", 50), ("gpu", 2)]));
        assert_eq!(info.get_runtime(), ResourceVector::from([("cpu", 50)]));
        assert_eq!(info.runtime_version(), 1);
    }

    #[test]
    fn clear_for_reset_drops_transient_state() {
        let info = QuotaInfo::from_spec(&spec("app", 100, 20));
        info.apply_delta(DeltaKind::Request, &ResourceVector::from([("cpu", 5)]))
            .unwrap();
        info.apply_delta(DeltaKind::Used, &ResourceVector::from([("cpu", 5)]))
            .unwrap();
        info.lock().commit_runtime(ResourceVector::from([("cpu", 5)]));

        info.clear_for_reset();
        let snap = info.deep_copy();
        assert!(snap.calculate_info.request.is_empty());
        assert!(snap.calculate_info.used.is_empty());
        assert!(snap.calculate_info.runtime.is_empty());
        assert_eq!(snap.runtime_version, 0);
        assert_eq!(snap.calculate_info.max.get("cpu"), 100);
    }

    #[test]
    fn getters_return_copies() {
        let info = QuotaInfo::from_spec(&spec("app", 100, 20));
        let mut max = info.get_max();
        max.set("cpu", 1);
        assert_eq!(info.get_max().get("cpu"), 100);
    }
}
