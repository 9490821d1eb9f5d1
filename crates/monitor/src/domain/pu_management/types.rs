//! Core data structures shared by the processing-unit lifecycle components.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, LazyLock};

use api_types::{EventInfo, Service};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static CONTEXT_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-zA-Z0-9_].{0,11}$").expect("context id pattern is valid"));

/// Errors raised while turning wire values into domain identifiers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("Context id is empty")]
    EmptyContextId,

    #[error("Context id `{value}` does not match the expected naming pattern")]
    MalformedContextId { value: String },

    #[error("Process id `{value}` is not a valid pid")]
    InvalidPid { value: String },
}

/// Errors raised by membership cache mutations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MembershipError {
    #[error("Processing unit not found: {context_id}")]
    UnitNotFound { context_id: ContextId },

    #[error("Processing unit already registered: {context_id}")]
    UnitAlreadyRegistered { context_id: ContextId },

    #[error("Process {pid} already belongs to processing unit {owner}")]
    ProcessOwnedByOtherUnit { pid: u32, owner: ContextId },

    #[error("Process {pid} is not a member of processing unit {context_id}")]
    ProcessNotMember { pid: u32, context_id: ContextId },

    #[error("Processing unit {context_id} still has {members} member processes")]
    UnitNotEmpty { context_id: ContextId, members: usize },
}

/// Raw processing unit identifier, used as cache and context store key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(String);

impl ContextId {
    /// Validate a raw unit identifier.
    ///
    /// A single leading `/` is accepted and stripped, matching the form the
    /// release notifier and older clients send.
    pub fn parse(raw: &str) -> Result<Self, IdentifierError> {
        let value = raw.strip_prefix('/').unwrap_or(raw);
        if value.is_empty() {
            return Err(IdentifierError::EmptyContextId);
        }
        if value.contains('/') || value == "." || value == ".." || !CONTEXT_ID_PATTERN.is_match(value)
        {
            return Err(IdentifierError::MalformedContextId {
                value: raw.to_string(),
            });
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContextId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Parse the wire pid of an event.
pub fn parse_pid(raw: &str) -> Result<u32, IdentifierError> {
    raw.trim()
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid != 0)
        .ok_or_else(|| IdentifierError::InvalidPid {
            value: raw.to_string(),
        })
}

/// Both identifiers of one processing unit.
///
/// The raw id keys the cache and the context store, the published id is what the
/// policy handler knows the unit by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitIdentity {
    context_id: ContextId,
    published_id: String,
}

impl UnitIdentity {
    pub fn new(context_id: ContextId, cgroup_mark: Option<&str>) -> Self {
        let published_id = format!("{context_id}{}", cgroup_mark.unwrap_or_default());
        Self {
            context_id,
            published_id,
        }
    }

    pub fn context_id(&self) -> &ContextId {
        &self.context_id
    }

    pub fn published_id(&self) -> &str {
        &self.published_id
    }
}

/// Options block produced by metadata extraction
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuntimeOptions {
    /// net_cls mark value, decimal
    pub cgroup_mark: Option<String>,
    /// Name of the cgroup the workload is tracked under
    pub cgroup_name: String,
    /// Services exposed by the workload
    pub services: Vec<Service>,
}

/// Runtime information of a processing unit, immutable once a unit is active
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuntimeInfo {
    /// Default IP address of the workload, if any
    pub default_ip: Option<String>,
    /// Policy tags
    pub tags: BTreeMap<String, String>,
    pub options: RuntimeOptions,
}

impl RuntimeInfo {
    pub fn cgroup_mark(&self) -> Option<&str> {
        self.options.cgroup_mark.as_deref().filter(|mark| !mark.is_empty())
    }
}

/// Live state of one active processing unit
#[derive(Debug, Clone)]
pub struct MembershipEntry {
    pub identity: UnitIdentity,
    pub runtime: Arc<RuntimeInfo>,
    /// Member processes, keyed by host pid
    pub processes: HashSet<u32>,
}

impl MembershipEntry {
    pub fn new(identity: UnitIdentity, runtime: Arc<RuntimeInfo>) -> Self {
        Self {
            identity,
            runtime,
            processes: HashSet::new(),
        }
    }

    pub fn add_process(&mut self, pid: u32) {
        self.processes.insert(pid);
    }

    pub fn remove_process(&mut self, pid: u32) -> bool {
        self.processes.remove(&pid)
    }

    pub fn has_process(&self, pid: u32) -> bool {
        self.processes.contains(&pid)
    }

    /// Member pids in ascending order
    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.processes.iter().copied().collect();
        pids.sort_unstable();
        pids
    }
}

/// Record persisted in the context store for every active unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredContext {
    /// Mark value the unit's cgroups were classified with
    pub mark_val: String,
    /// Event that first started the unit
    pub event_info: EventInfo,
}

/// Notifications sent to the policy handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PuEvent {
    Create,
    Start,
    Stop,
    Pause,
    Destroy,
}

impl fmt::Display for PuEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Kind of a telemetry container record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEvent {
    Start,
}

impl ContainerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerEvent::Start => "start",
        }
    }
}

/// Telemetry record emitted when a processing unit becomes active
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub context_id: String,
    pub ip_address: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub event: ContainerEvent,
}

/// Counters over the membership cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MembershipStats {
    pub total_units: usize,
    pub total_processes: usize,
}
