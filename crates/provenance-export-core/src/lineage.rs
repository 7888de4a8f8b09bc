use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use time::OffsetDateTime;

use crate::{clean_relative_path, Activity, ActivityId, ExportError};

/// Lookup from generated path to the activities that wrote it.
///
/// Paths are keyed with `.` components removed. Generators of each path are
/// kept in `(ended_at, activity_seq)` order so the last entry is the one
/// responsible for the current file contents.
#[derive(Debug, Default)]
pub struct ActivityIndex<'a> {
    generators: BTreeMap<PathBuf, Vec<&'a Activity>>,
}

impl<'a> ActivityIndex<'a> {
    pub fn new<I>(activities: I) -> Self
    where
        I: IntoIterator<Item = &'a Activity>,
    {
        let mut generators: BTreeMap<PathBuf, Vec<&'a Activity>> = BTreeMap::new();
        for activity in activities {
            for path in &activity.generations {
                let entry = generators.entry(clean_relative_path(path)).or_default();
                if !entry.iter().any(|known| known.id == activity.id) {
                    entry.push(activity);
                }
            }
        }
        for entries in generators.values_mut() {
            entries.sort_by_key(|activity| activity.ordering_key());
        }
        Self { generators }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }

    /// Activities that generated `path` itself or a directory containing it.
    #[must_use]
    pub fn generators_of(&self, path: &Path) -> Vec<&'a Activity> {
        let cleaned = clean_relative_path(path);
        cleaned
            .ancestors()
            .filter_map(|ancestor| self.generators.get(ancestor))
            .flat_map(|entries| entries.iter().copied())
            .collect()
    }

    /// The last generator of `path` that finished before `consumer` started.
    #[must_use]
    pub fn latest_producer_for(&self, path: &Path, consumer: &Activity) -> Option<&'a Activity> {
        self.generators_of(path)
            .into_iter()
            .filter(|producer| producer.precedes(consumer))
            .max_by_key(|producer| producer.ordering_key())
    }

    /// Current generator of every indexed path equal to or below `target`.
    #[must_use]
    pub fn current_generators_under(&self, target: &Path) -> Vec<&'a Activity> {
        let target = clean_relative_path(target);
        self.generators
            .iter()
            .filter(|(path, _)| path.starts_with(&target))
            .filter_map(|(_, entries)| entries.last().copied())
            .collect()
    }
}

/// Drops activities whose outputs were all regenerated by a later activity.
///
/// An activity is overridden when some strictly later activity (by
/// `(ended_at, activity_seq)`) generated a superset of its generations.
/// Activities without generations are kept. Input order is preserved.
pub fn filter_overridden_activities<'a, I>(activities: I) -> Vec<&'a Activity>
where
    I: IntoIterator<Item = &'a Activity>,
{
    let activities: Vec<&'a Activity> = activities.into_iter().collect();
    activities
        .iter()
        .copied()
        .filter(|candidate| {
            !activities
                .iter()
                .any(|later| is_overridden_by(candidate, later))
        })
        .collect()
}

fn is_overridden_by(candidate: &Activity, later: &Activity) -> bool {
    candidate.id != later.id
        && !candidate.generations.is_empty()
        && later.ordering_key() > candidate.ordering_key()
        && candidate
            .generations
            .iter()
            .all(|path| later.generates(path))
}

/// Selects the activities that produced `targets`, plus all their ancestors.
///
/// Target producers are the current generators of every indexed path at or
/// below a target. Ancestors are followed through usages: the producer of a
/// used path is its latest generator that precedes the consumer. Only
/// activities present in `activities` are returned, in recording order.
pub fn select_downstream_activities<'a, I>(
    activities: I,
    index: &ActivityIndex<'a>,
    targets: &[PathBuf],
) -> Vec<&'a Activity>
where
    I: IntoIterator<Item = &'a Activity>,
{
    let candidates: BTreeMap<ActivityId, &'a Activity> = activities
        .into_iter()
        .map(|activity| (activity.id, activity))
        .collect();

    let mut pending: Vec<&'a Activity> = targets
        .iter()
        .flat_map(|target| index.current_generators_under(target))
        .filter(|activity| candidates.contains_key(&activity.id))
        .collect();

    let mut selected: BTreeMap<ActivityId, &'a Activity> = BTreeMap::new();
    while let Some(activity) = pending.pop() {
        if selected.insert(activity.id, activity).is_some() {
            continue;
        }

        for usage in &activity.usages {
            if let Some(producer) = index.latest_producer_for(usage, activity) {
                if candidates.contains_key(&producer.id) && !selected.contains_key(&producer.id)
                {
                    pending.push(producer);
                }
            }
        }
    }

    let mut result: Vec<&'a Activity> = selected.into_values().collect();
    result.sort_by_key(|activity| (activity.activity_seq, activity.id));
    result
}

type ReadyKey = (OffsetDateTime, OffsetDateTime, i64, ActivityId);

fn ready_key(activity: &Activity) -> ReadyKey {
    (
        activity.ended_at,
        activity.started_at,
        activity.activity_seq,
        activity.id,
    )
}

/// Orders activities so every producer comes before its consumers.
///
/// Among activities whose producers are all placed, the earliest by
/// `(ended_at, started_at, activity_seq, id)` goes first.
///
/// # Errors
/// Returns [`ExportError::DependencyCycle`] naming every activity that could
/// not be placed.
pub fn sort_activities<'a, I>(activities: I) -> Result<Vec<&'a Activity>, ExportError>
where
    I: IntoIterator<Item = &'a Activity>,
{
    let nodes: BTreeMap<ActivityId, &'a Activity> = activities
        .into_iter()
        .map(|activity| (activity.id, activity))
        .collect();
    let index = ActivityIndex::new(nodes.values().copied());

    let mut consumers: BTreeMap<ActivityId, BTreeSet<ActivityId>> = BTreeMap::new();
    let mut indegree: BTreeMap<ActivityId, usize> = nodes.keys().map(|id| (*id, 0)).collect();

    for consumer in nodes.values() {
        for usage in &consumer.usages {
            for producer in index.generators_of(usage) {
                if !producer.precedes(consumer) {
                    continue;
                }
                if consumers.entry(producer.id).or_default().insert(consumer.id) {
                    *indegree.entry(consumer.id).or_default() += 1;
                }
            }
        }
    }

    let mut ready: BTreeSet<ReadyKey> = nodes
        .values()
        .copied()
        .filter(|activity| indegree.get(&activity.id).copied().unwrap_or(0) == 0)
        .map(ready_key)
        .collect();

    let mut ordered = Vec::with_capacity(nodes.len());
    while let Some(key) = ready.pop_first() {
        let id = key.3;
        let Some(activity) = nodes.get(&id) else {
            continue;
        };
        ordered.push(*activity);

        let Some(children) = consumers.get(&id) else {
            continue;
        };
        for child in children {
            let Some(remaining) = indegree.get_mut(child) else {
                continue;
            };
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                if let Some(child_activity) = nodes.get(child) {
                    ready.insert(ready_key(child_activity));
                }
            }
        }
    }

    if ordered.len() != nodes.len() {
        let placed: BTreeSet<ActivityId> = ordered.iter().map(|activity| activity.id).collect();
        let stuck = nodes
            .keys()
            .filter(|id| !placed.contains(id))
            .copied()
            .collect();
        return Err(ExportError::DependencyCycle(stuck));
    }

    Ok(ordered)
}

/// Filter, index, select and sort in one pass over the full history.
///
/// The overridden filter runs on the whole history before selection.
///
/// # Errors
/// Propagates [`ExportError::DependencyCycle`] from [`sort_activities`].
pub fn trace_lineage<'a>(
    activities: &'a [Activity],
    targets: &[PathBuf],
) -> Result<Vec<&'a Activity>, ExportError> {
    let relevant = filter_overridden_activities(activities);
    let index = ActivityIndex::new(relevant.iter().copied());
    let selected = select_downstream_activities(relevant.iter().copied(), &index, targets);
    tracing::debug!(
        total = activities.len(),
        relevant = relevant.len(),
        selected = selected.len(),
        "traced activity lineage"
    );
    sort_activities(selected)
}
