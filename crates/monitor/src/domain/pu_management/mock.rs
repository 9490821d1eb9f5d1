//! In-memory collaborators for lifecycle tests
//!
//! Every mock records the calls it receives and can be told to fail specific
//! operations.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use api_types::EventInfo;
use error_stack::Report;
use tempfile::TempDir;

use super::controller::LifecycleController;
use super::error::{ClassifierError, ExtractError, PolicyError};
use super::traits::{
    CgroupClassifier, ClassifierResult, EventCollector, MetadataExtractor, PolicyHandler,
};
use super::types::{ContainerRecord, PuEvent, RuntimeInfo, RuntimeOptions};
use crate::infrastructure::context_store::ContextStore;

pub const BASE_CGROUP: &str = "/pu-monitor";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyCall {
    SetRuntime(String),
    Event(String, PuEvent),
}

/// Policy handler that records every call
#[derive(Default)]
pub struct RecordingPolicy {
    calls: Mutex<Vec<PolicyCall>>,
    failing_events: Mutex<HashSet<PuEvent>>,
    fail_set_runtime: Mutex<bool>,
}

impl RecordingPolicy {
    pub fn calls(&self) -> Vec<PolicyCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<(String, PuEvent)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                PolicyCall::Event(id, event) => Some((id, event)),
                PolicyCall::SetRuntime(_) => None,
            })
            .collect()
    }

    pub fn count(&self, event: PuEvent) -> usize {
        self.events().iter().filter(|(_, e)| *e == event).count()
    }

    pub fn fail_event(&self, event: PuEvent) {
        self.failing_events.lock().unwrap().insert(event);
    }

    pub fn fail_set_runtime(&self, enabled: bool) {
        *self.fail_set_runtime.lock().unwrap() = enabled;
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl PolicyHandler for RecordingPolicy {
    fn set_runtime(
        &self,
        context_id: &str,
        _runtime: &RuntimeInfo,
    ) -> Result<(), Report<PolicyError>> {
        self.calls
            .lock()
            .unwrap()
            .push(PolicyCall::SetRuntime(context_id.to_string()));
        if *self.fail_set_runtime.lock().unwrap() {
            return Err(Report::new(PolicyError::Rejected {
                message: "mock set_runtime failure".to_string(),
            }));
        }
        Ok(())
    }

    fn handle_event(&self, context_id: &str, event: PuEvent) -> Result<(), Report<PolicyError>> {
        self.calls
            .lock()
            .unwrap()
            .push(PolicyCall::Event(context_id.to_string(), event));
        if self.failing_events.lock().unwrap().contains(&event) {
            return Err(Report::new(PolicyError::Unavailable {
                message: format!("mock {event} failure"),
            }));
        }
        Ok(())
    }
}

/// Extractor producing a fixed mark and `key=value` tags from the event
pub struct StaticExtractor {
    mark: Mutex<Option<String>>,
    fail: Mutex<bool>,
    calls: Mutex<usize>,
}

impl StaticExtractor {
    pub fn new(mark: Option<&str>) -> Self {
        Self {
            mark: Mutex::new(mark.map(str::to_string)),
            fail: Mutex::new(false),
            calls: Mutex::new(0),
        }
    }

    pub fn set_mark(&self, mark: Option<&str>) {
        *self.mark.lock().unwrap() = mark.map(str::to_string);
    }

    pub fn set_error_mode(&self, enabled: bool) {
        *self.fail.lock().unwrap() = enabled;
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl MetadataExtractor for StaticExtractor {
    fn extract(&self, event: &EventInfo) -> Result<RuntimeInfo, Report<ExtractError>> {
        *self.calls.lock().unwrap() += 1;
        if *self.fail.lock().unwrap() {
            return Err(Report::new(ExtractError::InvalidMetadata {
                message: "mock extraction failure".to_string(),
            }));
        }

        let tags = event
            .tags
            .iter()
            .filter_map(|tag| tag.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Ok(RuntimeInfo {
            default_ip: Some("10.0.0.1".to_string()),
            tags,
            options: RuntimeOptions {
                cgroup_mark: self.mark.lock().unwrap().clone(),
                cgroup_name: format!("{BASE_CGROUP}/{}", event.pid),
                services: event.services.clone(),
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassifierOp {
    Create,
    Delete,
    AssignMark,
    AddProcess,
    ListGroups,
    ListMembers,
    MarkOf,
    DeleteBase,
}

/// Mutating classifier calls, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifierCall {
    Create(String),
    Delete(String),
    AssignMark(String, u32),
    AddProcess(String, u32),
    DeleteBase(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockGroup {
    pub mark: Option<String>,
    pub members: Vec<u32>,
}

/// In-memory cgroup hierarchy
#[derive(Default)]
pub struct MockClassifier {
    groups: Mutex<BTreeMap<String, MockGroup>>,
    calls: Mutex<Vec<ClassifierCall>>,
    failing: Mutex<HashSet<ClassifierOp>>,
    failing_groups: Mutex<HashSet<(ClassifierOp, String)>>,
}

impl MockClassifier {
    /// Seed a live group, as left behind by a previous monitor instance
    pub fn insert_group(&self, cgroup: &str, mark: Option<&str>, members: &[u32]) {
        self.groups.lock().unwrap().insert(
            cgroup.to_string(),
            MockGroup {
                mark: mark.map(str::to_string),
                members: members.to_vec(),
            },
        );
    }

    pub fn group(&self, cgroup: &str) -> Option<MockGroup> {
        self.groups.lock().unwrap().get(cgroup).cloned()
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.lock().unwrap().keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<ClassifierCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail(&self, op: ClassifierOp) {
        self.failing.lock().unwrap().insert(op);
    }

    /// Fail `op` for a single group only
    pub fn fail_group(&self, op: ClassifierOp, cgroup: &str) {
        self.failing_groups
            .lock()
            .unwrap()
            .insert((op, cgroup.to_string()));
    }

    pub fn recover(&self, op: ClassifierOp) {
        self.failing.lock().unwrap().remove(&op);
    }

    fn check(
        &self,
        op: ClassifierOp,
        cgroup: &str,
        context: ClassifierError,
    ) -> ClassifierResult<()> {
        let failing = self.failing.lock().unwrap().contains(&op)
            || self
                .failing_groups
                .lock()
                .unwrap()
                .contains(&(op, cgroup.to_string()));
        if failing {
            return Err(Report::new(context).attach_printable("mock failure"));
        }
        Ok(())
    }

    fn record(&self, call: ClassifierCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl CgroupClassifier for MockClassifier {
    fn create_group(&self, cgroup: &str) -> ClassifierResult<()> {
        self.record(ClassifierCall::Create(cgroup.to_string()));
        self.check(
            ClassifierOp::Create,
            cgroup,
            ClassifierError::Create {
                cgroup: cgroup.to_string(),
            },
        )?;
        self.groups
            .lock()
            .unwrap()
            .entry(cgroup.to_string())
            .or_default();
        Ok(())
    }

    fn delete_group(&self, cgroup: &str) -> ClassifierResult<()> {
        self.record(ClassifierCall::Delete(cgroup.to_string()));
        self.check(
            ClassifierOp::Delete,
            cgroup,
            ClassifierError::Delete {
                cgroup: cgroup.to_string(),
            },
        )?;
        self.groups.lock().unwrap().remove(cgroup);
        Ok(())
    }

    fn assign_mark(&self, cgroup: &str, mark: u32) -> ClassifierResult<()> {
        self.record(ClassifierCall::AssignMark(cgroup.to_string(), mark));
        let context = ClassifierError::AssignMark {
            cgroup: cgroup.to_string(),
            mark,
        };
        self.check(ClassifierOp::AssignMark, cgroup, context)?;
        match self.groups.lock().unwrap().get_mut(cgroup) {
            Some(group) => {
                group.mark = Some(mark.to_string());
                Ok(())
            }
            None => Err(Report::new(ClassifierError::AssignMark {
                cgroup: cgroup.to_string(),
                mark,
            })),
        }
    }

    fn add_process(&self, cgroup: &str, pid: u32) -> ClassifierResult<()> {
        self.record(ClassifierCall::AddProcess(cgroup.to_string(), pid));
        self.check(
            ClassifierOp::AddProcess,
            cgroup,
            ClassifierError::AddProcess {
                cgroup: cgroup.to_string(),
                pid,
            },
        )?;
        match self.groups.lock().unwrap().get_mut(cgroup) {
            Some(group) => {
                if !group.members.contains(&pid) {
                    group.members.push(pid);
                }
                Ok(())
            }
            None => Err(Report::new(ClassifierError::AddProcess {
                cgroup: cgroup.to_string(),
                pid,
            })),
        }
    }

    fn list_groups(&self) -> ClassifierResult<Vec<String>> {
        self.check(ClassifierOp::ListGroups, "", ClassifierError::Enumerate)?;
        Ok(self.group_names())
    }

    fn list_group_members(&self, cgroup: &str) -> ClassifierResult<Vec<u32>> {
        let context = ClassifierError::Read {
            cgroup: cgroup.to_string(),
        };
        self.check(ClassifierOp::ListMembers, cgroup, context)?;
        Ok(self
            .group(cgroup)
            .map(|group| group.members)
            .unwrap_or_default())
    }

    fn mark_of(&self, cgroup: &str) -> ClassifierResult<Option<String>> {
        let context = ClassifierError::Read {
            cgroup: cgroup.to_string(),
        };
        self.check(ClassifierOp::MarkOf, cgroup, context)?;
        Ok(self.group(cgroup).and_then(|group| group.mark))
    }

    fn delete_base_path(&self, base: &str) -> ClassifierResult<()> {
        self.record(ClassifierCall::DeleteBase(base.to_string()));
        self.check(
            ClassifierOp::DeleteBase,
            base,
            ClassifierError::Delete {
                cgroup: base.to_string(),
            },
        )
    }
}

#[derive(Default)]
pub struct RecordingCollector {
    records: Mutex<Vec<ContainerRecord>>,
}

impl RecordingCollector {
    pub fn records(&self) -> Vec<ContainerRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl EventCollector for RecordingCollector {
    fn collect_container_event(&self, record: ContainerRecord) {
        self.records.lock().unwrap().push(record);
    }
}

pub type MockController =
    LifecycleController<RecordingPolicy, StaticExtractor, MockClassifier, RecordingCollector>;

/// A controller wired to in-memory collaborators and a temporary context store
pub struct Harness {
    pub dir: TempDir,
    pub store: ContextStore,
    pub policy: Arc<RecordingPolicy>,
    pub extractor: Arc<StaticExtractor>,
    pub classifier: Arc<MockClassifier>,
    pub collector: Arc<RecordingCollector>,
    pub controller: MockController,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = ContextStore::open(dir.path().join("uid")).unwrap();
        Self::with_parts(dir, store, Arc::new(MockClassifier::default()))
    }

    fn with_parts(dir: TempDir, store: ContextStore, classifier: Arc<MockClassifier>) -> Self {
        let policy = Arc::new(RecordingPolicy::default());
        let extractor = Arc::new(StaticExtractor::new(Some("100")));
        let collector = Arc::new(RecordingCollector::default());
        let controller = LifecycleController::new(
            store.clone(),
            BASE_CGROUP,
            Arc::clone(&policy),
            Arc::clone(&extractor),
            Arc::clone(&classifier),
            Arc::clone(&collector),
        )
        .unwrap();
        Self {
            dir,
            store,
            policy,
            extractor,
            classifier,
            collector,
            controller,
        }
    }

    /// Simulate a monitor restart: fresh controller and collaborators, the store
    /// and the cgroup hierarchy survive.
    pub fn restart(self) -> Self {
        Self::with_parts(self.dir, self.store, self.classifier)
    }
}

pub fn start_event(puid: &str, pid: u32) -> EventInfo {
    EventInfo {
        event_type: Some(api_types::EventType::Start),
        puid: puid.to_string(),
        pid: pid.to_string(),
        tags: vec!["app=web".to_string()],
        ..Default::default()
    }
}

pub fn stop_event(puid: &str) -> EventInfo {
    EventInfo {
        event_type: Some(api_types::EventType::Stop),
        puid: puid.to_string(),
        ..Default::default()
    }
}

pub fn release_event(cgroup: &str) -> EventInfo {
    EventInfo {
        event_type: Some(api_types::EventType::Stop),
        cgroup: Some(cgroup.to_string()),
        ..Default::default()
    }
}
