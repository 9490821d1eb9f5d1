//! Processing-unit lifecycle state machine
//!
//! A unit moves through `Unseen -> Active -> Gone`. The first Start of an unseen id
//! activates it with the policy handler, classifies the pid in its own net_cls
//! cgroup and persists the event so the unit can be recovered after a restart. Every
//! further Start adds a member process. The Stop that releases the last member
//! tears the unit down; Destroy carries no work of its own.
//!
//! Start and Stop hold the membership lock for their whole execution, collaborator
//! calls included, so all transitions are serialized.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use api_types::{EventInfo, EventType};
use error_stack::{Report, ResultExt};
use regex::Regex;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::error::{MonitorError, MonitorResult};
use super::membership::MembershipCache;
use super::resync::ResyncReport;
use super::traits::{CgroupClassifier, EventCollector, MetadataExtractor, PolicyHandler};
use super::types::{
    parse_pid, ContainerEvent, ContainerRecord, ContextId, MembershipError, MembershipStats,
    PuEvent, RuntimeInfo, StoredContext, UnitIdentity,
};
use crate::infrastructure::context_store::{is_not_found, ContextStore};

/// Result of a Start event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// First process of a previously unseen unit
    Activated(UnitIdentity),
    /// Process added to an already active unit
    Joined {
        context_id: ContextId,
        pid: u32,
        members: usize,
    },
}

/// Result of a Stop event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// The release notification was for the base cgroup itself
    BaseCgroupDeleted,
    /// The unit still has member processes and stays active
    ProcessReleased {
        context_id: ContextId,
        pid: Option<u32>,
        remaining: usize,
    },
    /// The last member process stopped
    UnitTornDown(TeardownReport),
    /// Nothing is tracked under the event's id
    Untracked,
}

/// Result of [`LifecycleController::handle_event`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Created,
    Started(StartOutcome),
    Stopped(StopOutcome),
    Paused,
    Destroyed,
    Resynced(ResyncReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TeardownStep {
    ReleaseCgroup,
    PolicyStop,
    RemoveEntry,
    RemoveRecord,
    PolicyDestroy,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            TeardownStep::ReleaseCgroup => "release-cgroup",
            TeardownStep::PolicyStop => "policy-stop",
            TeardownStep::RemoveEntry => "remove-entry",
            TeardownStep::RemoveRecord => "remove-record",
            TeardownStep::PolicyDestroy => "policy-destroy",
        };
        f.write_str(step)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub step: TeardownStep,
    pub message: String,
}

/// Outcome of tearing down a unit after its last process stopped.
///
/// Every step is attempted; the ones that failed are listed in `failures`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub identity: UnitIdentity,
    pub pid: u32,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    fn new(identity: UnitIdentity, pid: u32) -> Self {
        Self {
            identity,
            pid,
            failures: Vec::new(),
        }
    }

    fn record(&mut self, step: TeardownStep, message: impl fmt::Display) {
        self.failures.push(TeardownFailure {
            step,
            message: message.to_string(),
        });
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_steps(&self) -> Vec<TeardownStep> {
        self.failures.iter().map(|failure| failure.step).collect()
    }
}

/// What a Stop or Pause event refers to
#[derive(Debug, Clone, PartialEq, Eq)]
enum StopTarget {
    BaseCgroup,
    /// Last path segment, a pid or a unit id
    Segment(String),
}

/// Lifecycle controller for processing units
pub struct LifecycleController<P, E, C, T> {
    policy: Arc<P>,
    extractor: Arc<E>,
    pub(super) classifier: Arc<C>,
    collector: Arc<T>,
    pub(super) store: ContextStore,
    cache: Mutex<MembershipCache>,
    /// Base cgroup, normalized to a single leading `/`
    base_cgroup: String,
    release_pattern: Regex,
}

impl<P, E, C, T> LifecycleController<P, E, C, T> {
    pub fn base_cgroup(&self) -> &str {
        &self.base_cgroup
    }

    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    pub fn stats(&self) -> MembershipStats {
        self.lock_cache().stats()
    }

    /// Member pids of a unit, empty when the unit is not active
    pub fn unit_processes(&self, context_id: &ContextId) -> Vec<u32> {
        self.lock_cache().unit_processes(context_id)
    }

    pub fn identity(&self, context_id: &ContextId) -> Option<UnitIdentity> {
        self.lock_cache()
            .get(context_id)
            .map(|entry| entry.identity.clone())
    }

    pub fn unit_for_pid(&self, pid: u32) -> Option<ContextId> {
        self.lock_cache().unit_for_pid(pid).cloned()
    }

    /// A panic while holding the lock leaves both indices consistent, every
    /// mutation updates them together.
    fn lock_cache(&self) -> MutexGuard<'_, MembershipCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P, E, C, T> LifecycleController<P, E, C, T>
where
    P: PolicyHandler,
    E: MetadataExtractor,
    C: CgroupClassifier,
    T: EventCollector,
{
    pub fn new(
        store: ContextStore,
        base_cgroup: &str,
        policy: Arc<P>,
        extractor: Arc<E>,
        classifier: Arc<C>,
        collector: Arc<T>,
    ) -> MonitorResult<Self> {
        let trimmed = base_cgroup.trim_matches('/');
        if trimmed.is_empty() || trimmed.contains('/') {
            return Err(Report::new(MonitorError::InvalidBaseCgroup {
                base: base_cgroup.to_string(),
            }));
        }
        let base_cgroup = format!("/{trimmed}");
        let release_pattern = Regex::new(&format!(
            "^{}/[a-zA-Z0-9_].{{0,11}}$",
            regex::escape(&base_cgroup)
        ))
        .change_context_lazy(|| MonitorError::InvalidBaseCgroup {
            base: base_cgroup.clone(),
        })?;

        Ok(Self {
            policy,
            extractor,
            classifier,
            collector,
            store,
            cache: Mutex::new(MembershipCache::new()),
            base_cgroup,
            release_pattern,
        })
    }

    /// Route an event to its handler by event type.
    pub fn handle_event(&self, event: &EventInfo) -> MonitorResult<EventOutcome> {
        let Some(event_type) = event.event_type else {
            return Err(Report::new(MonitorError::InvalidEvent).attach_printable("missing event type"));
        };
        debug!(event = %event_type, puid = %event.puid, pid = %event.pid, "Handling lifecycle event");

        match event_type {
            EventType::Create => self.create(event).map(|()| EventOutcome::Created),
            EventType::Start => self.start(event).map(EventOutcome::Started),
            EventType::Stop => self.stop(event).map(EventOutcome::Stopped),
            EventType::Pause => self.pause(event).map(|()| EventOutcome::Paused),
            EventType::Destroy => self.destroy(event).map(|()| EventOutcome::Destroyed),
            EventType::Resync => self.resync().map(EventOutcome::Resynced),
        }
    }

    /// Announce a unit to the policy handler. Membership is not touched.
    pub fn create(&self, event: &EventInfo) -> MonitorResult<()> {
        let context_id = ContextId::parse(&event.puid).change_context(MonitorError::InvalidEvent)?;

        self.policy
            .handle_event(context_id.as_str(), PuEvent::Create)
            .change_context_lazy(|| MonitorError::Policy {
                context_id: context_id.to_string(),
                event: PuEvent::Create,
            })
    }

    /// Add the event's pid to its unit, activating the unit on its first process.
    pub fn start(&self, event: &EventInfo) -> MonitorResult<StartOutcome> {
        let context_id = ContextId::parse(&event.puid).change_context(MonitorError::InvalidEvent)?;
        let pid = parse_pid(&event.pid).change_context(MonitorError::InvalidEvent)?;

        let mut cache = self.lock_cache();

        if let Some(owner) = cache.unit_for_pid(pid) {
            if owner != &context_id {
                return Err(Report::new(MembershipError::ProcessOwnedByOtherUnit {
                    pid,
                    owner: owner.clone(),
                })
                .change_context(MonitorError::Membership));
            }
        }

        if let Some(entry) = cache.get(&context_id) {
            let runtime = Arc::clone(&entry.runtime);
            cache
                .add_process(&context_id, pid)
                .change_context(MonitorError::Membership)?;
            let members = cache.unit_processes(&context_id).len();

            // Membership is kept even when the binding fails. The pid's cgroup is
            // already gone, so no release notification follows. Only an explicit
            // Stop for the pid, or a restart followed by resync, clears it.
            self.classify(pid, &runtime)?;

            info!(context_id = %context_id, pid = pid, members = members, "Process joined active unit");
            return Ok(StartOutcome::Joined {
                context_id,
                pid,
                members,
            });
        }

        let runtime = self
            .extractor
            .extract(event)
            .change_context_lazy(|| MonitorError::Metadata {
                context_id: context_id.to_string(),
            })?;
        let identity = UnitIdentity::new(context_id.clone(), runtime.cgroup_mark());
        let published_id = identity.published_id();

        self.policy
            .set_runtime(published_id, &runtime)
            .change_context_lazy(|| MonitorError::Policy {
                context_id: published_id.to_string(),
                event: PuEvent::Start,
            })?;
        self.policy
            .handle_event(published_id, PuEvent::Start)
            .change_context_lazy(|| MonitorError::Policy {
                context_id: published_id.to_string(),
                event: PuEvent::Start,
            })
            .inspect_err(|report| {
                error!(context_id = %context_id, error = ?report, "Failed to activate processing unit");
            })?;

        let mark = self.classify(pid, &runtime)?;

        self.collector.collect_container_event(ContainerRecord {
            context_id: context_id.to_string(),
            ip_address: runtime.default_ip.clone(),
            tags: runtime.tags.clone(),
            event: ContainerEvent::Start,
        });

        cache
            .register_unit(identity.clone(), Arc::new(runtime), pid)
            .change_context(MonitorError::Membership)?;

        self.store
            .store(
                &context_id,
                &StoredContext {
                    mark_val: mark.to_string(),
                    event_info: event.clone(),
                },
            )
            .change_context_lazy(|| MonitorError::Store {
                context_id: context_id.to_string(),
            })?;

        info!(
            context_id = %context_id,
            published_id = %identity.published_id(),
            pid = pid,
            mark = mark,
            "Processing unit activated"
        );
        Ok(StartOutcome::Activated(identity))
    }

    /// Release a process, tearing the unit down when it was the last member.
    ///
    /// The event names either a unit id or, for kernel release notifications, the
    /// released cgroup path whose last segment is the pid.
    pub fn stop(&self, event: &EventInfo) -> MonitorResult<StopOutcome> {
        let segment = match self.stop_target(event)? {
            StopTarget::BaseCgroup => {
                self.classifier
                    .delete_base_path(&self.base_cgroup)
                    .change_context_lazy(|| MonitorError::Classification {
                        cgroup: self.base_cgroup.clone(),
                    })?;
                return Ok(StopOutcome::BaseCgroupDeleted);
            }
            StopTarget::Segment(segment) => segment,
        };

        let mut cache = self.lock_cache();

        let owner = segment
            .parse::<u32>()
            .ok()
            .and_then(|pid| cache.unit_for_pid(pid).map(|owner| (pid, owner.clone())));
        let (pid, context_id) = match owner {
            Some((pid, owner)) => (Some(pid), owner),
            None => (
                None,
                ContextId::parse(&segment).change_context(MonitorError::InvalidEvent)?,
            ),
        };

        let Some(entry) = cache.get(&context_id) else {
            debug!(segment = %segment, "Stop for untracked processing unit");
            return Ok(StopOutcome::Untracked);
        };
        let identity = entry.identity.clone();

        let Some(pid) = pid else {
            let remaining = entry.processes.len();
            debug!(
                context_id = %context_id,
                remaining = remaining,
                "Stop by unit id releases no process"
            );
            return Ok(StopOutcome::ProcessReleased {
                context_id,
                pid: None,
                remaining,
            });
        };

        let remaining = cache
            .release_process(&context_id, pid)
            .change_context(MonitorError::Membership)?;
        let cgroup = pid.to_string();
        let released = self.classifier.delete_group(&cgroup);

        if remaining > 0 {
            released.change_context(MonitorError::Classification { cgroup })?;
            info!(context_id = %context_id, pid = pid, remaining = remaining, "Process stopped");
            return Ok(StopOutcome::ProcessReleased {
                context_id,
                pid: Some(pid),
                remaining,
            });
        }

        let published_id = identity.published_id().to_string();
        let mut report = TeardownReport::new(identity, pid);

        if let Err(err) = released {
            warn!(context_id = %context_id, cgroup = %cgroup, error = ?err, "Failed to delete cgroup");
            report.record(TeardownStep::ReleaseCgroup, err.current_context());
        }
        if let Err(err) = self.policy.handle_event(&published_id, PuEvent::Stop) {
            warn!(context_id = %context_id, error = ?err, "Failed to stop processing unit");
            report.record(TeardownStep::PolicyStop, err.current_context());
        }
        if let Err(err) = cache.remove_unit(&context_id) {
            warn!(context_id = %context_id, error = %err, "Failed to remove membership entry");
            report.record(TeardownStep::RemoveEntry, err);
        }
        match self.store.remove(&context_id) {
            Ok(()) => {}
            Err(err) if is_not_found(&err) => {
                debug!(context_id = %context_id, "No stored context to remove");
            }
            Err(err) => {
                error!(context_id = %context_id, error = ?err, "Failed to remove stored context");
                report.record(TeardownStep::RemoveRecord, err.current_context());
            }
        }
        if let Err(err) = self.policy.handle_event(&published_id, PuEvent::Destroy) {
            warn!(context_id = %context_id, error = ?err, "Failed to destroy processing unit");
            report.record(TeardownStep::PolicyDestroy, err.current_context());
        }

        if report.is_clean() {
            info!(context_id = %context_id, pid = pid, "Processing unit torn down");
        } else {
            warn!(
                context_id = %context_id,
                pid = pid,
                failed_steps = ?report.failed_steps(),
                "Processing unit torn down with failures"
            );
        }
        Ok(StopOutcome::UnitTornDown(report))
    }

    /// Forward a pause notice. Membership is not touched.
    pub fn pause(&self, event: &EventInfo) -> MonitorResult<()> {
        let segment = match self.stop_target(event)? {
            StopTarget::BaseCgroup => {
                return Err(Report::new(MonitorError::InvalidEvent)
                    .attach_printable("the base cgroup cannot be paused"));
            }
            StopTarget::Segment(segment) => segment,
        };
        let context_id = ContextId::parse(&segment).change_context(MonitorError::InvalidEvent)?;

        self.policy
            .handle_event(context_id.as_str(), PuEvent::Pause)
            .change_context_lazy(|| MonitorError::Policy {
                context_id: context_id.to_string(),
                event: PuEvent::Pause,
            })
    }

    /// Destruction happens with the last Stop.
    pub fn destroy(&self, event: &EventInfo) -> MonitorResult<()> {
        debug!(puid = %event.puid, "Ignoring destroy event");
        Ok(())
    }

    fn stop_target(&self, event: &EventInfo) -> MonitorResult<StopTarget> {
        if let Some(cgroup) = event.cgroup.as_deref().filter(|c| !c.is_empty()) {
            if cgroup.trim_end_matches('/') == self.base_cgroup {
                return Ok(StopTarget::BaseCgroup);
            }
            if !self.release_pattern.is_match(cgroup) {
                return Err(Report::new(MonitorError::InvalidEvent)
                    .attach_printable(format!("invalid cgroup path `{cgroup}`")));
            }
            return Ok(StopTarget::Segment(last_segment(cgroup).to_string()));
        }

        let segment = last_segment(&event.puid);
        if segment.is_empty() {
            return Err(Report::new(MonitorError::InvalidEvent)
                .attach_printable(format!("invalid unit id `{}`", event.puid)));
        }
        if segment == &self.base_cgroup[1..] {
            return Ok(StopTarget::BaseCgroup);
        }
        Ok(StopTarget::Segment(segment.to_string()))
    }

    /// Bind `pid` to its own net_cls cgroup carrying the unit's mark.
    ///
    /// On failure after the cgroup was created the cgroup is deleted again.
    fn classify(&self, pid: u32, runtime: &RuntimeInfo) -> MonitorResult<u32> {
        let cgroup = pid.to_string();
        let classification = || MonitorError::Classification {
            cgroup: cgroup.clone(),
        };

        self.classifier
            .create_group(&cgroup)
            .change_context_lazy(classification)?;

        let Some(raw_mark) = runtime.cgroup_mark() else {
            self.discard_group(&cgroup);
            return Err(Report::new(MonitorError::MissingMark {
                cgroup: cgroup.clone(),
            }));
        };
        let mark = match raw_mark.trim().parse::<u32>() {
            Ok(mark) => mark,
            Err(err) => {
                self.discard_group(&cgroup);
                return Err(Report::new(err).change_context(MonitorError::InvalidMark {
                    cgroup: cgroup.clone(),
                    mark: raw_mark.to_string(),
                }));
            }
        };

        if let Err(err) = self.classifier.assign_mark(&cgroup, mark) {
            self.discard_group(&cgroup);
            return Err(err.change_context(classification()));
        }
        if let Err(err) = self.classifier.add_process(&cgroup, pid) {
            self.discard_group(&cgroup);
            return Err(err.change_context(classification()));
        }

        debug!(cgroup = %cgroup, mark = mark, "Process classified");
        Ok(mark)
    }

    fn discard_group(&self, cgroup: &str) {
        if let Err(err) = self.classifier.delete_group(cgroup) {
            warn!(cgroup = cgroup, error = ?err, "Failed to clean cgroup");
        }
    }
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
