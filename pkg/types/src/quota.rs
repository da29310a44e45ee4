use serde::{Deserialize, Serialize};

use crate::resource::ResourceVector;

/// Observed definition of an elastic quota group, as delivered by the
/// quota watcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaGroupSpec {
    pub name: String,
    /// Parent group. Empty means the group hangs off the root.
    #[serde(default)]
    pub parent_name: String,
    /// Parent groups only aggregate their children and cannot hold workloads.
    #[serde(default)]
    pub is_parent: bool,
    /// Whether unused guarantee may be borrowed by sibling groups.
    #[serde(default = "default_allow_lent_resource")]
    pub allow_lent_resource: bool,
    /// Hard cap. Undeclared resources get no runtime.
    #[serde(default)]
    pub max: ResourceVector,
    /// Declared guarantee.
    #[serde(default)]
    pub min: ResourceVector,
    /// Weight used when competing for capacity beyond guarantees.
    /// Falls back to `max` when unset or all-zero.
    #[serde(default)]
    pub shared_weight: ResourceVector,
}

fn default_allow_lent_resource() -> bool {
    true
}

impl QuotaGroupSpec {
    /// The weight the group actually competes with.
    pub fn effective_shared_weight(&self) -> ResourceVector {
        if self.shared_weight.is_zero() {
            self.max.clone()
        } else {
            self.shared_weight.clone()
        }
    }
}

/// Which accumulator a workload delta applies to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeltaKind {
    Request,
    Used,
}

impl std::fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeltaKind::Request => write!(f, "request"),
            DeltaKind::Used => write!(f, "used"),
        }
    }
}

/// Signed change produced by a workload admission (positive) or removal
/// (negative).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaDelta {
    pub quota_name: String,
    pub resource_delta: ResourceVector,
    pub kind: DeltaKind,
}
