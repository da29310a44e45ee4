use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Named resource quantities (`cpu` in millicores, `memory` in bytes,
/// extended resources in device units).
///
/// A missing key reads as zero for arithmetic. When a vector is used as an
/// upper bound (a group's Max), a missing key means "no constraint".
/// Keys are kept ordered so iteration and serialization are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVector(BTreeMap<String, i64>);

impl ResourceVector {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Quantity for `name`, zero when absent.
    pub fn get(&self, name: &str) -> i64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    /// Quantity for `name`, `None` when the key is not declared.
    pub fn quantity(&self, name: &str) -> Option<i64> {
        self.0.get(name).copied()
    }

    pub fn set(&mut self, name: impl Into<String>, value: i64) {
        self.0.insert(name.into(), value);
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Declared resource names.
    pub fn resource_names(&self) -> BTreeSet<String> {
        self.0.keys().cloned().collect()
    }

    /// True when every declared quantity is zero (or nothing is declared).
    pub fn is_zero(&self) -> bool {
        self.0.values().all(|v| *v == 0)
    }

    /// Componentwise sum over the union of keys. Saturates at the `i64`
    /// bounds.
    pub fn add(&self, other: &ResourceVector) -> ResourceVector {
        let mut out = self.clone();
        for (name, value) in other.iter() {
            let slot = out.0.entry(name.to_string()).or_insert(0);
            *slot = slot.saturating_add(value);
        }
        out
    }

    /// Componentwise difference over the union of keys. May go negative;
    /// saturates at the `i64` bounds.
    pub fn subtract(&self, other: &ResourceVector) -> ResourceVector {
        let mut out = self.clone();
        for (name, value) in other.iter() {
            let slot = out.0.entry(name.to_string()).or_insert(0);
            *slot = slot.saturating_sub(value);
        }
        out
    }

    /// Names of the components below zero.
    pub fn is_negative(&self) -> Vec<String> {
        self.0
            .iter()
            .filter(|(_, v)| **v < 0)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Replace every negative component with zero.
    pub fn clamp_negative_to_zero(&mut self) {
        for name in self.is_negative() {
            self.0.insert(name, 0);
        }
    }

    /// Keep only the components whose name is in `names`.
    pub fn mask(&self, names: &BTreeSet<String>) -> ResourceVector {
        ResourceVector(
            self.0
                .iter()
                .filter(|(k, _)| names.contains(*k))
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        )
    }

    /// Multiply every component by `numerator / denominator`, rounding down.
    /// A non-positive denominator scales everything to zero.
    pub fn scale_proportional(&self, numerator: i64, denominator: i64) -> ResourceVector {
        ResourceVector(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), scale_quantity(*v, numerator, denominator)))
                .collect(),
        )
    }

    /// Cap each component at `bound`. Keys missing from `bound` are left as-is.
    pub fn min_per_key(&self, bound: &ResourceVector) -> ResourceVector {
        ResourceVector(
            self.0
                .iter()
                .map(|(k, v)| match bound.quantity(k) {
                    Some(b) if *v > b => (k.clone(), b),
                    _ => (k.clone(), *v),
                })
                .collect(),
        )
    }

    /// Componentwise maximum over the union of keys.
    pub fn max_per_key(&self, other: &ResourceVector) -> ResourceVector {
        let mut out = self.clone();
        for (name, value) in other.iter() {
            let entry = out.0.entry(name.to_string()).or_insert(value);
            if *entry < value {
                *entry = value;
            }
        }
        out
    }

    /// True if every component is within `bound`; keys absent from `bound`
    /// are unconstrained.
    pub fn less_equal_per_key(&self, bound: &ResourceVector) -> bool {
        self.iter()
            .all(|(k, v)| bound.quantity(k).is_none_or(|b| v <= b))
    }
}

/// Compare the `name` component of two vectors, treating absence as zero.
pub fn cmp_key(a: &ResourceVector, b: &ResourceVector, name: &str) -> Ordering {
    a.get(name).cmp(&b.get(name))
}

/// `value * numerator / denominator` rounded down, computed in 128 bits.
pub fn scale_quantity(value: i64, numerator: i64, denominator: i64) -> i64 {
    if denominator <= 0 {
        return 0;
    }
    let scaled = (value as i128 * numerator as i128).div_euclid(denominator as i128);
    scaled.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

impl<K: Into<String>> FromIterator<(K, i64)> for ResourceVector {
    fn from_iter<T: IntoIterator<Item = (K, i64)>>(iter: T) -> Self {
        ResourceVector(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl<const N: usize> From<[(&str, i64); N]> for ResourceVector {
    fn from(entries: [(&str, i64); N]) -> Self {
        entries.into_iter().collect()
    }
}

impl std::fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", name, value)?;
        }
        write!(f, "}}")
    }
}
