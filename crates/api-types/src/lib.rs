//! Shared API type definitions
//!
//! This crate contains the lifecycle event types exchanged between monitor
//! clients, the kernel release notifier and the processing-unit monitor. The same
//! `EventInfo` is persisted verbatim in the context store so that it can be
//! replayed after a monitor restart.

use serde::Deserialize;
use serde::Serialize;

/// Lifecycle event kind carried by an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Start,
    Stop,
    Pause,
    Destroy,
    Resync,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventType::Create => "create",
            EventType::Start => "start",
            EventType::Stop => "stop",
            EventType::Pause => "pause",
            EventType::Destroy => "destroy",
            EventType::Resync => "resync",
        };
        f.write_str(name)
    }
}

/// Kind of workload a processing unit represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PuType {
    /// A process tree launched through the monitor client
    LinuxProcess,
    /// A login session identified by the user credential
    #[default]
    UidLogin,
}

/// A protocol/port pair the workload listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Service {
    /// IP protocol number, e.g. 6 for TCP
    pub protocol: u8,
    /// Listening port, 0 for any
    pub port: u16,
}

/// A lifecycle event for one processing unit
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInfo {
    /// Event kind
    pub event_type: Option<EventType>,
    /// Workload kind
    #[serde(default)]
    pub pu_type: PuType,
    /// Processing unit identifier
    #[serde(default)]
    pub puid: String,
    /// Human readable service name
    #[serde(default)]
    pub name: String,
    /// Process identifier as sent on the wire
    #[serde(default)]
    pub pid: String,
    /// Released cgroup path, only set by the kernel release notifier on stop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cgroup: Option<String>,
    /// `key=value` labels attached to the workload
    #[serde(default)]
    pub tags: Vec<String>,
    /// Services exposed by the workload
    #[serde(default)]
    pub services: Vec<Service>,
    /// Only police traffic coming from the network
    #[serde(default)]
    pub network_only_traffic: bool,
    /// The workload is a host service
    #[serde(default)]
    pub host_service: bool,
}

impl EventInfo {
    /// Returns a copy of this event retargeted to another event kind and pid.
    pub fn replay_for(&self, event_type: EventType, pid: u32) -> Self {
        Self {
            event_type: Some(event_type),
            pid: pid.to_string(),
            ..self.clone()
        }
    }
}
