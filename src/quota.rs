//! Translator from human-readable quota-rejection text to structured
//! resource quantities.
//!
//! The control plane reports quota rejections as prose of the form
//! `... is forbidden: exceeded quota: <name>, requested: limits.cpu=4,
//! limits.memory=1Gi, used: ..., limited: ...`. This is the only place in
//! the crate that knows about that format; everything else consumes the
//! parsed [`ResourceList`]. If the platform ever exposes structured
//! rejection details, this module is the one to swap out.

use std::sync::OnceLock;

use regex::Regex;

use crate::cluster::{Quantity, ResourceList};
use crate::error::ClusterError;

fn section_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(requested|used|limited):\s*((?:limits\.[^=,\s]+=[^,\s]+,?\s*)+)")
            .expect("section regex is valid")
    })
}

fn pair_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"limits\.([^=,\s]+)=([^,\s]+)").expect("pair regex is valid")
    })
}

/// True when a failure is a quota rejection: a forbidden-class error whose
/// message cites an exceeded quota.
pub fn is_quota_exceeded(err: &ClusterError) -> bool {
    match err {
        ClusterError::Forbidden { message } => message.contains("exceeded quota"),
        _ => false,
    }
}

/// Extracts the rejected resource dimensions and quantities from a quota
/// rejection message.
///
/// Only the `requested:` group is read; `used:` and `limited:` are ignored.
/// Quantities that fail to parse are skipped, and a dimension cited more
/// than once keeps its smallest quantity. An unrecognized message yields an
/// empty list, which callers treat as "nothing to learn".
pub fn rejected_quantities(message: &str) -> ResourceList {
    let mut rejected = ResourceList::new();
    for section in section_re().captures_iter(message) {
        if &section[1] != "requested" {
            continue;
        }
        for pair in pair_re().captures_iter(&section[2]) {
            let Ok(quantity) = pair[2].parse::<Quantity>() else {
                continue;
            };
            rejected
                .entry(pair[1].to_string())
                .and_modify(|existing| {
                    if quantity < *existing {
                        *existing = quantity;
                    }
                })
                .or_insert(quantity);
        }
    }
    rejected
}
