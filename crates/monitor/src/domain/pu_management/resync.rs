//! Crash recovery
//!
//! After a restart the membership cache is empty while workloads keep running in
//! their classified cgroups. Resync rebuilds the cache from the context store,
//! using live cgroup membership as the source of truth for which units survived.

use std::collections::BTreeMap;

use api_types::EventType;
use error_stack::ResultExt;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::controller::LifecycleController;
use super::error::{MonitorError, MonitorResult};
use super::traits::{
    CgroupClassifier, ClassifierResult, EventCollector, MetadataExtractor, PolicyHandler,
};
use super::types::{ContextId, StoredContext};

/// Live cgroups grouped by mark
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveMarks {
    /// Member pids of all non-empty cgroups, keyed by mark
    pub marks: BTreeMap<u32, Vec<u32>>,
    /// Empty cgroups that were deleted
    pub deleted_cgroups: Vec<String>,
    /// Cgroups that could not be read or carry no usable mark
    pub skipped_cgroups: Vec<String>,
}

/// Enumerate live cgroups, deleting the empty ones.
///
/// Only a failure to list the groups is an error; unreadable groups are skipped.
pub fn collect_live_marks<C>(classifier: &C) -> ClassifierResult<LiveMarks>
where
    C: CgroupClassifier + ?Sized,
{
    let mut live = LiveMarks::default();

    for cgroup in classifier.list_groups()? {
        let pids = match classifier.list_group_members(&cgroup) {
            Ok(pids) => pids,
            Err(err) => {
                warn!(cgroup = %cgroup, error = ?err, "Failed to list cgroup members");
                live.skipped_cgroups.push(cgroup);
                continue;
            }
        };

        if pids.is_empty() {
            match classifier.delete_group(&cgroup) {
                Ok(()) => live.deleted_cgroups.push(cgroup),
                Err(err) => {
                    warn!(cgroup = %cgroup, error = ?err, "Error when deleting cgroup");
                    live.skipped_cgroups.push(cgroup);
                }
            }
            continue;
        }

        let mark = match classifier.mark_of(&cgroup) {
            Ok(Some(mark)) => mark,
            Ok(None) => {
                debug!(cgroup = %cgroup, "Cgroup has no mark");
                live.skipped_cgroups.push(cgroup);
                continue;
            }
            Err(err) => {
                warn!(cgroup = %cgroup, error = ?err, "Failed to read cgroup mark");
                live.skipped_cgroups.push(cgroup);
                continue;
            }
        };
        let Ok(mark) = mark.trim().parse::<u32>() else {
            warn!(cgroup = %cgroup, mark = %mark, "Cgroup carries an invalid mark");
            live.skipped_cgroups.push(cgroup);
            continue;
        };

        live.marks.entry(mark).or_default().extend(pids);
    }

    for pids in live.marks.values_mut() {
        pids.sort_unstable();
        pids.dedup();
    }
    Ok(live)
}

/// A replayed Start that failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayFailure {
    pub context_id: String,
    pub pid: u32,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub deleted_cgroups: Vec<String>,
    pub skipped_cgroups: Vec<String>,
    /// Stored contexts without live processes, removed from the store
    pub removed_contexts: Vec<String>,
    pub reacquired: Vec<(String, u32)>,
    pub failures: Vec<ReplayFailure>,
    /// Store entries that could not be read
    pub skipped_contexts: Vec<String>,
}

impl ResyncReport {
    fn log(&self) {
        if !self.deleted_cgroups.is_empty() {
            info!(cgroups = %self.deleted_cgroups.join(","), "Deleted empty cgroups");
        }
        if !self.removed_contexts.is_empty() {
            info!(contexts = %self.removed_contexts.join(","), "Deleted dead contexts");
        }
        if !self.reacquired.is_empty() {
            let reacquired: Vec<String> = self
                .reacquired
                .iter()
                .map(|(context_id, pid)| format!("{context_id}:{pid}"))
                .collect();
            info!(contexts = %reacquired.join(","), "Reacquired contexts");
        }
        if !self.skipped_contexts.is_empty() {
            warn!(contexts = %self.skipped_contexts.join(","), "Skipped unreadable contexts");
        }
        if !self.failures.is_empty() {
            warn!(failures = self.failures.len(), "Some processes could not be reacquired");
        }
    }
}

impl<P, E, C, T> LifecycleController<P, E, C, T>
where
    P: PolicyHandler,
    E: MetadataExtractor,
    C: CgroupClassifier,
    T: EventCollector,
{
    /// Rebuild membership from the context store and live cgroups.
    ///
    /// Records whose mark no longer has live processes are removed. Every live pid
    /// of a surviving record is replayed through [`LifecycleController::start`];
    /// replays are independent of each other.
    pub fn resync(&self) -> MonitorResult<ResyncReport> {
        let live = collect_live_marks(self.classifier.as_ref())
            .change_context(MonitorError::ResyncUnavailable)?;
        let walker = self
            .store
            .walk()
            .change_context(MonitorError::ResyncUnavailable)?;

        let mut report = ResyncReport {
            deleted_cgroups: live.deleted_cgroups,
            skipped_cgroups: live.skipped_cgroups,
            ..Default::default()
        };

        for name in walker {
            let context_id = match ContextId::parse(&name) {
                Ok(context_id) => context_id,
                Err(err) => {
                    warn!(entry = %name, error = %err, "Skipping invalid context store entry");
                    report.skipped_contexts.push(name);
                    continue;
                }
            };

            let stored: StoredContext = match self.store.get(&context_id) {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(context_id = %context_id, error = ?err, "Failed to read stored context");
                    report.skipped_contexts.push(name);
                    continue;
                }
            };

            let pids = stored
                .mark_val
                .trim()
                .parse::<u32>()
                .ok()
                .and_then(|mark| live.marks.get(&mark));
            let Some(pids) = pids else {
                match self.store.remove(&context_id) {
                    Ok(()) => report.removed_contexts.push(name),
                    Err(err) => {
                        warn!(context_id = %context_id, error = ?err, "Error when removing context in the store");
                    }
                }
                continue;
            };

            for &pid in pids {
                let replay = stored.event_info.replay_for(EventType::Start, pid);
                match self.start(&replay) {
                    Ok(_) => report.reacquired.push((name.clone(), pid)),
                    Err(err) => {
                        error!(context_id = %context_id, pid = pid, error = ?err, "Error when restarting processing unit");
                        report.failures.push(ReplayFailure {
                            context_id: name.clone(),
                            pid,
                            message: err.current_context().to_string(),
                        });
                    }
                }
            }
        }

        report.log();
        Ok(report)
    }
}
