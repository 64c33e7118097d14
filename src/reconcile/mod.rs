//! Turns a freshly fetched listing plus what is already stored for the same
//! source into an insert/update/delete plan.
//!
//! The reconciler is pure: it performs no I/O, so the same inputs always yield
//! the same plan and the plan for an unchanged source is empty.

mod tree;

pub use tree::validate_hierarchy;

use crate::model::{
    Format, ImportProblem, Meeting, RecordKey, ServiceBody, Source, SourceId, SourceSnapshot,
};
use crate::source_client::FetchedListing;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("meeting {meeting_id} references unknown service body {service_body_id}")]
    UnknownServiceBodyReference {
        meeting_id: i64,
        service_body_id: i64,
    },

    #[error("service body {service_body_id} references unknown parent {parent_id}")]
    UnknownParent {
        service_body_id: i64,
        parent_id: i64,
    },

    #[error("service body {service_body_id} is part of a parent cycle")]
    ParentCycle { service_body_id: i64 },

    #[error("duplicate {kind} id {id}, keeping the first occurrence")]
    DuplicateId { kind: &'static str, id: i64 },
}

/// How a record's change is detected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComparePolicy {
    /// Compare last-changed markers instead of content when both records carry one.
    pub trust_last_changed: bool,
}

impl ComparePolicy {
    pub fn for_source(source: &Source) -> Self {
        Self {
            trust_last_changed: source.trust_last_changed,
        }
    }
}

/// A record the reconciler can key and compare.
pub trait Reconcilable {
    fn key(&self) -> RecordKey;
    fn same_content(&self, other: &Self) -> bool;
    fn last_changed(&self) -> Option<DateTime<Utc>> {
        None
    }
}

impl Reconcilable for ServiceBody {
    fn key(&self) -> RecordKey {
        ServiceBody::key(self)
    }

    fn same_content(&self, other: &Self) -> bool {
        self == other
    }
}

impl Reconcilable for Format {
    fn key(&self) -> RecordKey {
        Format::key(self)
    }

    fn same_content(&self, other: &Self) -> bool {
        self == other
    }
}

impl Reconcilable for Meeting {
    fn key(&self) -> RecordKey {
        Meeting::key(self)
    }

    fn same_content(&self, other: &Self) -> bool {
        Meeting::same_content(self, other)
    }

    fn last_changed(&self) -> Option<DateTime<Utc>> {
        self.last_changed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityPlan<T> {
    pub to_insert: Vec<T>,
    pub to_update: Vec<T>,
    /// Sorted by key.
    pub to_delete: Vec<RecordKey>,
}

impl<T> Default for EntityPlan<T> {
    fn default() -> Self {
        Self {
            to_insert: Vec::new(),
            to_update: Vec::new(),
            to_delete: Vec::new(),
        }
    }
}

impl<T> EntityPlan<T> {
    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.to_insert.len() + self.to_update.len() + self.to_delete.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    /// The fresh listing is the complete truth for the source.
    Full,
    /// The fresh listing only carries changes since the last cutoff.
    Incremental,
    /// Everything stored for the source is dropped before the plan is applied.
    Reset,
}

/// Everything that changes for one source in one cycle. Applied atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePlan {
    pub source_id: SourceId,
    pub mode: PlanMode,
    pub service_bodies: EntityPlan<ServiceBody>,
    pub meetings: EntityPlan<Meeting>,
    pub formats: EntityPlan<Format>,
    /// Replaces the source's stored import problems.
    pub problems: Vec<ImportProblem>,
    pub errors: Vec<ReconcileError>,
    pub change_cutoff: Option<DateTime<Utc>>,
}

impl SourcePlan {
    pub fn is_empty(&self) -> bool {
        self.mode != PlanMode::Reset
            && self.service_bodies.is_empty()
            && self.meetings.is_empty()
            && self.formats.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.service_bodies.change_count()
            + self.meetings.change_count()
            + self.formats.change_count()
    }
}

fn has_changed<T: Reconcilable>(policy: ComparePolicy, previous: &T, fresh: &T) -> bool {
    if policy.trust_last_changed {
        if let (Some(before), Some(after)) = (previous.last_changed(), fresh.last_changed()) {
            return before != after;
        }
    }
    !previous.same_content(fresh)
}

/// Keyed diff of two complete record sets.
pub fn diff_records<T: Reconcilable>(
    previous: &[T],
    fresh: Vec<T>,
    policy: ComparePolicy,
) -> EntityPlan<T> {
    let previous_by_key: HashMap<RecordKey, &T> = previous.iter().map(|r| (r.key(), r)).collect();
    let mut plan = EntityPlan::default();
    let mut seen: HashSet<RecordKey> = HashSet::with_capacity(fresh.len());

    for record in fresh {
        let key = record.key();
        if !seen.insert(key) {
            continue;
        }
        match previous_by_key.get(&key) {
            None => plan.to_insert.push(record),
            Some(stored) if has_changed(policy, *stored, &record) => plan.to_update.push(record),
            Some(_) => {}
        }
    }

    let mut deletes: Vec<RecordKey> = previous_by_key
        .keys()
        .filter(|key| !seen.contains(key))
        .copied()
        .collect();
    deletes.sort();
    plan.to_delete = deletes;
    plan
}

/// Records rejected while validating a fresh listing, with the reason.
struct Rejections {
    source_id: SourceId,
    errors: Vec<ReconcileError>,
    problems: Vec<ImportProblem>,
}

impl Rejections {
    fn new(source_id: SourceId, problems: Vec<ImportProblem>) -> Self {
        Self {
            source_id,
            errors: Vec::new(),
            problems,
        }
    }

    fn reject<R: Serialize>(&mut self, error: ReconcileError, record: &R) {
        self.problems.push(ImportProblem::new(
            self.source_id,
            error.to_string(),
            serde_json::to_string(record).ok(),
        ));
        self.errors.push(error);
    }
}

fn dedupe<T: Reconcilable + Serialize>(
    records: Vec<T>,
    kind: &'static str,
    rejections: &mut Rejections,
) -> Vec<T> {
    let mut seen = HashSet::with_capacity(records.len());
    let mut unique = Vec::with_capacity(records.len());
    for record in records {
        let key = record.key();
        if seen.insert(key) {
            unique.push(record);
        } else {
            rejections.reject(
                ReconcileError::DuplicateId {
                    kind,
                    id: key.local_id,
                },
                &record,
            );
        }
    }
    unique
}

/// Validated fresh records, ready to be diffed.
struct ValidatedListing {
    service_bodies: Vec<ServiceBody>,
    meetings: Vec<Meeting>,
    formats: Vec<Format>,
    /// Fresh meetings excluded because of their service body.
    rejected_meeting_ids: Vec<i64>,
    valid_service_body_ids: HashSet<i64>,
    deleted_meeting_ids: Vec<i64>,
    change_cutoff: Option<DateTime<Utc>>,
    rejections: Rejections,
}

fn validate(source_id: SourceId, fresh: FetchedListing) -> ValidatedListing {
    let mut rejections = Rejections::new(source_id, fresh.problems);

    let bodies = dedupe(fresh.service_bodies, "service body", &mut rejections);
    let (service_bodies, excluded) = validate_hierarchy(bodies);
    for (error, body) in excluded {
        rejections.reject(error, &body);
    }
    let valid_service_body_ids: HashSet<i64> =
        service_bodies.iter().map(|b| b.local_id).collect();

    let mut meetings = Vec::with_capacity(fresh.meetings.len());
    let mut rejected_meeting_ids = Vec::new();
    for meeting in dedupe(fresh.meetings, "meeting", &mut rejections) {
        if valid_service_body_ids.contains(&meeting.service_body_id) {
            meetings.push(meeting);
        } else {
            rejections.reject(
                ReconcileError::UnknownServiceBodyReference {
                    meeting_id: meeting.local_id,
                    service_body_id: meeting.service_body_id,
                },
                &meeting,
            );
            rejected_meeting_ids.push(meeting.local_id);
        }
    }

    let formats = dedupe(fresh.formats, "format", &mut rejections);

    ValidatedListing {
        service_bodies,
        meetings,
        formats,
        rejected_meeting_ids,
        valid_service_body_ids,
        deleted_meeting_ids: fresh.deleted_meeting_ids,
        change_cutoff: fresh.change_cutoff,
        rejections,
    }
}

/// Plan for a full listing: whatever the source no longer lists is deleted.
pub fn diff(
    source_id: SourceId,
    previous: &SourceSnapshot,
    fresh: FetchedListing,
    policy: ComparePolicy,
) -> SourcePlan {
    let listing = validate(source_id, fresh);
    SourcePlan {
        source_id,
        mode: PlanMode::Full,
        service_bodies: diff_records(&previous.service_bodies, listing.service_bodies, policy),
        meetings: diff_records(&previous.meetings, listing.meetings, policy),
        formats: diff_records(&previous.formats, listing.formats, policy),
        problems: listing.rejections.problems,
        errors: listing.rejections.errors,
        change_cutoff: listing.change_cutoff,
    }
}

/// Plan for a changed-since listing. Fresh meetings are upserts, meetings the
/// source flags as deleted are removed and everything else stays as stored.
/// Service bodies and formats are always listed in full and are diffed as such.
pub fn diff_incremental(
    source_id: SourceId,
    previous: &SourceSnapshot,
    fresh: FetchedListing,
    policy: ComparePolicy,
) -> SourcePlan {
    let listing = validate(source_id, fresh);
    let service_bodies = diff_records(&previous.service_bodies, listing.service_bodies, policy);
    let formats = diff_records(&previous.formats, listing.formats, policy);

    let stored: HashMap<i64, &Meeting> =
        previous.meetings.iter().map(|m| (m.local_id, m)).collect();
    let mut meetings = EntityPlan::default();
    let mut upserted: HashSet<i64> = HashSet::with_capacity(listing.meetings.len());

    for meeting in listing.meetings {
        upserted.insert(meeting.local_id);
        match stored.get(&meeting.local_id) {
            None => meetings.to_insert.push(meeting),
            Some(existing) if has_changed(policy, *existing, &meeting) => {
                meetings.to_update.push(meeting)
            }
            Some(_) => {}
        }
    }

    // Stored meetings go away when the source deleted them, when their fresh
    // version was rejected, or when their service body no longer exists.
    let mut deletes: BTreeSet<i64> = BTreeSet::new();
    deletes.extend(
        listing
            .deleted_meeting_ids
            .iter()
            .chain(listing.rejected_meeting_ids.iter())
            .filter(|id| stored.contains_key(*id) && !upserted.contains(*id))
            .copied(),
    );
    deletes.extend(
        previous
            .meetings
            .iter()
            .filter(|m| !upserted.contains(&m.local_id))
            .filter(|m| !listing.valid_service_body_ids.contains(&m.service_body_id))
            .map(|m| m.local_id),
    );
    meetings.to_delete = deletes
        .into_iter()
        .map(|id| RecordKey::new(source_id, id))
        .collect();

    SourcePlan {
        source_id,
        mode: PlanMode::Incremental,
        service_bodies,
        meetings,
        formats,
        problems: listing.rejections.problems,
        errors: listing.rejections.errors,
        change_cutoff: listing.change_cutoff,
    }
}
