//! Validation of a source's service body hierarchy.

use super::ReconcileError;
use crate::model::ServiceBody;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Rooted,
    Excluded,
}

/// Splits service bodies into those whose parent chain reaches a root and
/// those that must be excluded (unknown parent, cycle, or an excluded ancestor).
///
/// Input order is preserved in both outputs.
pub fn validate_hierarchy(
    bodies: Vec<ServiceBody>,
) -> (Vec<ServiceBody>, Vec<(ReconcileError, ServiceBody)>) {
    let parents: HashMap<i64, Option<i64>> =
        bodies.iter().map(|b| (b.local_id, b.parent_id)).collect();

    let mut verdicts: HashMap<i64, Verdict> = HashMap::with_capacity(bodies.len());
    let mut cycle_members: HashSet<i64> = HashSet::new();

    for body in &bodies {
        let mut path: Vec<i64> = Vec::new();
        let mut current = body.local_id;
        let verdict = loop {
            if let Some(verdict) = verdicts.get(&current) {
                break *verdict;
            }
            if let Some(start) = path.iter().position(|id| *id == current) {
                cycle_members.extend(path[start..].iter().copied());
                break Verdict::Excluded;
            }
            path.push(current);
            match parents.get(&current).copied().flatten() {
                None => break Verdict::Rooted,
                Some(parent) if parents.contains_key(&parent) => current = parent,
                Some(_) => break Verdict::Excluded,
            }
        };
        for id in path {
            verdicts.insert(id, verdict);
        }
    }

    let mut valid = Vec::with_capacity(bodies.len());
    let mut excluded = Vec::new();
    for body in bodies {
        if verdicts.get(&body.local_id) == Some(&Verdict::Rooted) {
            valid.push(body);
            continue;
        }
        let error = if cycle_members.contains(&body.local_id) {
            ReconcileError::ParentCycle {
                service_body_id: body.local_id,
            }
        } else {
            ReconcileError::UnknownParent {
                service_body_id: body.local_id,
                parent_id: body.parent_id.unwrap_or_default(),
            }
        };
        excluded.push((error, body));
    }
    (valid, excluded)
}
