//! Cluster object model shared by the lifecycle manager, backoff layer and
//! watch binding.
//!
//! These are deliberately plain data types: the control plane itself lives
//! behind the [`crate::client::ClusterClient`] trait, and everything here is
//! what crosses that seam.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Namespace/name pair identifying an object within a resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reference from an owned object back to the object that controls it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub controller: bool,
}

/// Field-management bookkeeping attached to a persisted object by the
/// control plane. Only its size matters to this crate: the staleness store
/// truncates it on every write from the sole writer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedFieldsEntry {
    pub manager: String,
    pub operation: String,
}

/// Standard object metadata carried by every cluster object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    /// Opaque version token; changes whenever the object actually changes.
    #[serde(default)]
    pub resource_version: String,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub managed_fields: Vec<ManagedFieldsEntry>,
}

impl ObjectMeta {
    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::new(self.namespace.clone(), self.name.clone())
    }

    /// The owner reference marked as controlling, if any.
    pub fn controller(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }

    pub fn is_deleted(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// A resource quantity in the cluster's notation: an integer or decimal
/// count with an optional scale suffix, e.g. `4`, `500m`, `2Gi`, `1.5`.
///
/// Stored as milli-units in an `i128` so that even the largest suffix
/// (`Ei`, 2^60) survives the milli scaling exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Quantity(i128);

impl Quantity {
    pub fn from_milli(milli: i128) -> Self {
        Self(milli)
    }

    pub fn from_units(units: i64) -> Self {
        Self(i128::from(units) * 1000)
    }

    pub fn milli(&self) -> i128 {
        self.0
    }

    pub fn saturating_add(self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_add(other.0))
    }
}

/// Milli-units contributed by one whole unit of the given suffix.
fn suffix_scale(suffix: &str) -> Option<i128> {
    const KIB: i128 = 1024;
    Some(match suffix {
        "" => 1000,
        "m" => 1,
        "k" => 1000 * 1000,
        "M" => 1000 * 1000 * 1000,
        "G" => 1000 * 1000 * 1000 * 1000,
        "T" => 1000 * 1000 * 1000 * 1000 * 1000,
        "P" => 1000 * 1000 * 1000 * 1000 * 1000 * 1000,
        "E" => 1000 * 1000 * 1000 * 1000 * 1000 * 1000 * 1000,
        "Ki" => KIB * 1000,
        "Mi" => KIB.pow(2) * 1000,
        "Gi" => KIB.pow(3) * 1000,
        "Ti" => KIB.pow(4) * 1000,
        "Pi" => KIB.pow(5) * 1000,
        "Ei" => KIB.pow(6) * 1000,
        _ => return None,
    })
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid quantity {0:?}")]
pub struct ParseQuantityError(pub String);

impl FromStr for Quantity {
    type Err = ParseQuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);
        let scale = suffix_scale(suffix).ok_or_else(|| ParseQuantityError(s.to_string()))?;

        let (int_part, frac_part) = match number.split_once('.') {
            Some((i, f)) => (i, f),
            None => (number, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(ParseQuantityError(s.to_string()));
        }
        let int: i128 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| ParseQuantityError(s.to_string()))?
        };
        let mut milli = int
            .checked_mul(scale)
            .ok_or_else(|| ParseQuantityError(s.to_string()))?;
        if !frac_part.is_empty() {
            let frac: i128 = frac_part
                .parse()
                .map_err(|_| ParseQuantityError(s.to_string()))?;
            let denom = 10i128
                .checked_pow(frac_part.len() as u32)
                .ok_or_else(|| ParseQuantityError(s.to_string()))?;
            milli += frac
                .checked_mul(scale)
                .ok_or_else(|| ParseQuantityError(s.to_string()))?
                / denom;
        }
        Ok(Quantity(milli))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

/// Per-dimension quantity map, e.g. `{"cpu": 4, "memory": 1Gi}`.
pub type ResourceList = BTreeMap<String, Quantity>;

/// One schedulable sub-unit of a backing resource, carrying its declared
/// resource limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkUnit {
    pub name: String,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

/// The orchestrator-managed object representing a task's execution unit.
///
/// Identity-only instances (no work units, empty payload) are used on the
/// observe and finalize paths where only namespace+name matter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceObject {
    pub kind: String,
    pub meta: ObjectMeta,
    #[serde(default)]
    pub units: Vec<WorkUnit>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ResourceObject {
    /// Sum of per-work-unit limits across every dimension. Unparseable
    /// quantities are skipped rather than failing the launch.
    pub fn requested_limits(&self) -> ResourceList {
        let mut total = ResourceList::new();
        for unit in &self.units {
            for (dimension, raw) in &unit.limits {
                let Ok(quantity) = raw.parse::<Quantity>() else {
                    continue;
                };
                let entry = total.entry(dimension.clone()).or_default();
                *entry = entry.saturating_add(quantity);
            }
        }
        total
    }
}
