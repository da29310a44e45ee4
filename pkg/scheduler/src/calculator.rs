//! Runtime distribution over the quota tree.
//!
//! Each recalculation pass:
//! 1. aggregates Request/Used bottom-up (parents sum their children's
//!    limited request),
//! 2. walks the tree top-down; at every parent it scales the children's
//!    minimums to fit the parent's runtime, grants each child
//!    `min(AutoScaleMin, demand)`, then water-fills the remaining capacity
//!    by SharedWeight,
//! 3. commits each child's runtime, masked to its declared Max, under that
//!    child's own lock.
//!
//! Every resource name is distributed independently.

use pkg_constants::quota::SYSTEM_QUOTA_NAME;
use pkg_types::resource::{ResourceVector, scale_quantity};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::quota_info::QuotaInfo;
use crate::topology::QuotaTopology;

/// What one child brings to its parent's distribution, copied out under the
/// child's lock.
#[derive(Debug, Clone, Default)]
pub struct ChildDemand {
    pub name: String,
    pub original_min: ResourceVector,
    /// Request capped at Max.
    pub limit_request: ResourceVector,
    pub max: ResourceVector,
    pub shared_weight: ResourceVector,
    pub allow_lent_resource: bool,
}

impl ChildDemand {
    fn from_info(info: &QuotaInfo) -> Self {
        let state = info.lock();
        Self {
            name: info.name().to_string(),
            original_min: state.calculate_info.original_min.clone(),
            limit_request: state.limit_request(),
            max: state.calculate_info.max.clone(),
            shared_weight: state.calculate_info.shared_weight.clone(),
            allow_lent_resource: state.allow_lent_resource,
        }
    }
}

/// Result of one parent-level distribution for a single child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildAllocation {
    pub auto_scale_min: ResourceVector,
    pub runtime: ResourceVector,
}

/// Split `capacity` among `children`. Output order matches input order.
///
/// The result does not depend on the order of `children`.
pub fn distribute(capacity: &ResourceVector, children: &[ChildDemand]) -> Vec<ChildAllocation> {
    let mut allocations = vec![ChildAllocation::default(); children.len()];
    if children.is_empty() {
        return allocations;
    }

    let mut resource_names: BTreeSet<String> = capacity.resource_names();
    for child in children {
        resource_names.extend(child.original_min.resource_names());
        resource_names.extend(child.max.resource_names());
    }

    let names: Vec<&str> = children.iter().map(|c| c.name.as_str()).collect();
    for resource in &resource_names {
        let available = capacity.get(resource).max(0);

        let mins: Vec<i64> = children
            .iter()
            .map(|c| c.original_min.get(resource).max(0))
            .collect();
        let scaled_mins = auto_scale_mins(&mins, available);

        let mut demand = Vec::with_capacity(children.len());
        let mut weights = Vec::with_capacity(children.len());
        for (i, child) in children.iter().enumerate() {
            // No declared max means no runtime in this dimension.
            let Some(max) = child.max.quantity(resource) else {
                demand.push(0);
                weights.push(0);
                continue;
            };
            let mut wanted = child.limit_request.get(resource).max(0);
            if !child.allow_lent_resource {
                wanted = wanted.max(scaled_mins[i]);
            }
            demand.push(wanted.min(max.max(0)));
            // A resource missing from SharedWeight is weighted by its Max.
            let weight = child.shared_weight.quantity(resource).unwrap_or(max);
            weights.push(weight.max(0));
        }

        let mut granted: Vec<i64> = scaled_mins
            .iter()
            .zip(&demand)
            .map(|(min, wanted)| *min.min(wanted))
            .collect();
        let pool = available - granted.iter().sum::<i64>();
        water_fill(pool, &demand, &weights, &names, &mut granted);

        for (i, child) in children.iter().enumerate() {
            if child.original_min.contains_key(resource) {
                allocations[i].auto_scale_min.set(resource.clone(), scaled_mins[i]);
            }
            if child.max.contains_key(resource) {
                allocations[i].runtime.set(resource.clone(), granted[i]);
            }
        }
    }
    allocations
}

/// Scale `mins` down in equal proportion when their sum exceeds `capacity`.
fn auto_scale_mins(mins: &[i64], capacity: i64) -> Vec<i64> {
    let total: i128 = mins.iter().map(|m| *m as i128).sum();
    if total <= capacity as i128 {
        return mins.to_vec();
    }
    let (weights, total) = match i64::try_from(total) {
        Ok(total) => (mins.to_vec(), total),
        Err(_) => {
            // Sum beyond i64: shrink every min by the child count first.
            let n = mins.len() as i64;
            let reduced: Vec<i64> = mins.iter().map(|m| m / n).collect();
            let total = reduced.iter().sum();
            (reduced, total)
        }
    };
    weights
        .iter()
        .zip(mins)
        .map(|(w, min)| scale_quantity(*w, capacity, total).min(*min))
        .collect()
}

/// Hand out `pool` to children whose demand exceeds what they were granted,
/// proportionally to weight. A child whose share exceeds its remaining room
/// is capped and the surplus goes back to the pool for the others.
fn water_fill(
    mut pool: i64,
    demand: &[i64],
    weights: &[i64],
    names: &[&str],
    granted: &mut [i64],
) {
    let mut active: Vec<usize> = (0..demand.len())
        .filter(|&i| demand[i] > granted[i] && weights[i] > 0)
        .collect();

    // Each round either caps a child or leaves less than one unit per
    // active child, so `n + 1` rounds are enough.
    for _ in 0..=demand.len() {
        if pool <= 0 || active.is_empty() {
            break;
        }
        let total_weight: i128 = active.iter().map(|&i| weights[i] as i128).sum();
        let mut handed = 0;
        let mut still_active = Vec::with_capacity(active.len());
        for &i in &active {
            let share = (pool as i128 * weights[i] as i128 / total_weight) as i64;
            let give = share.min(demand[i] - granted[i]);
            granted[i] += give;
            handed += give;
            if granted[i] < demand[i] {
                still_active.push(i);
            }
        }
        pool -= handed;
        active = still_active;
        if handed == 0 {
            break;
        }
    }

    // Flooring leaves a few units behind; give them out one at a time,
    // heaviest weight first, ties by name.
    active.sort_by(|&a, &b| weights[b].cmp(&weights[a]).then(names[a].cmp(names[b])));
    while pool > 0 {
        let mut progressed = false;
        for &i in &active {
            if pool == 0 {
                break;
            }
            if granted[i] < demand[i] {
                granted[i] += 1;
                pool -= 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
}

/// How a tree pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Every node committed; carries the number of commits.
    Completed(usize),
    /// A newer topology appeared mid-walk; carries commits made before
    /// stopping.
    Superseded(usize),
}

/// Recompute Request/Used of every parent group from its children,
/// bottom-up. Leaf groups keep the values accumulated from deltas.
pub fn aggregate(topology: &QuotaTopology) {
    let order = topology.top_down_order();
    for name in order.iter().rev() {
        let Some(node) = topology.node(name) else {
            continue;
        };
        if !node.has_children() && !node.quota_info().is_parent() {
            continue;
        }
        let mut request = ResourceVector::new();
        let mut used = ResourceVector::new();
        for child in node.child_group_quota_infos().values() {
            let state = child.lock();
            request = request.add(&state.request_for_parent());
            used = used.add(&state.calculate_info.used);
        }
        node.quota_info().lock().set_aggregates(request, used);
    }
}

/// Distribute `cluster_total` through the tree, top-down.
///
/// The reserved system group sits outside the fair share: its runtime is
/// its own Max and its usage is taken off the top before the remaining
/// top-level groups split the cluster.
///
/// `superseded` is polled before each parent; when it returns true the walk
/// stops and already-committed nodes keep their new values.
pub fn distribute_tree(
    topology: &QuotaTopology,
    cluster_total: &ResourceVector,
    superseded: impl Fn() -> bool,
) -> PassOutcome {
    let mut committed = 0;

    let mut capacity = cluster_total.clone();
    let mut top_level: Vec<Arc<QuotaInfo>> = Vec::new();
    for name in topology.roots() {
        let Some(node) = topology.node(name) else {
            continue;
        };
        if name == SYSTEM_QUOTA_NAME {
            let mut state = node.quota_info().lock();
            capacity = capacity.subtract(&state.calculate_info.used);
            let max = state.calculate_info.max.clone();
            state.commit_runtime(max);
            committed += 1;
        } else {
            top_level.push(Arc::clone(node.quota_info()));
        }
    }
    capacity.clamp_negative_to_zero();
    committed += distribute_level(&capacity, &top_level);

    for name in topology.top_down_order() {
        let Some(node) = topology.node(&name) else {
            continue;
        };
        if !node.has_children() {
            continue;
        }
        if superseded() {
            return PassOutcome::Superseded(committed);
        }
        let parent_runtime = node.quota_info().get_runtime();
        let children: Vec<Arc<QuotaInfo>> =
            node.child_group_quota_infos().into_values().collect();
        committed += distribute_level(&parent_runtime, &children);
    }
    PassOutcome::Completed(committed)
}

/// One parent level: read each child, distribute, write each child back.
/// Locks are taken one child at a time.
fn distribute_level(capacity: &ResourceVector, children: &[Arc<QuotaInfo>]) -> usize {
    let demands: Vec<ChildDemand> = children.iter().map(|c| ChildDemand::from_info(c)).collect();
    let allocations = distribute(capacity, &demands);
    for (child, allocation) in children.iter().zip(allocations) {
        debug!(
            "Quota {} runtime {} (autoScaleMin {})",
            child.name(),
            allocation.runtime,
            allocation.auto_scale_min
        );
        let mut state = child.lock();
        state.set_auto_scale_min(allocation.auto_scale_min);
        state.commit_runtime(allocation.runtime);
    }
    children.len()
}
