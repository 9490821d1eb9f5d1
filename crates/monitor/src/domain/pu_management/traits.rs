//! Contracts of the collaborators driven by the lifecycle controller

use api_types::EventInfo;
use error_stack::Report;

use super::error::{ClassifierError, ExtractError, PolicyError};
use super::types::{ContainerRecord, PuEvent, RuntimeInfo};

pub type ClassifierResult<T> = Result<T, Report<ClassifierError>>;

/// Network policy enforcement handler
pub trait PolicyHandler: Send + Sync {
    /// Register the runtime of a unit under its published id
    fn set_runtime(&self, context_id: &str, runtime: &RuntimeInfo)
        -> Result<(), Report<PolicyError>>;

    /// Notify the handler about a lifecycle change of a unit
    fn handle_event(&self, context_id: &str, event: PuEvent) -> Result<(), Report<PolicyError>>;
}

/// Turns a raw lifecycle event into policy tags and a network mark.
///
/// Implementations must be free of side effects; the controller may call this
/// again for the same event during resync.
pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, event: &EventInfo) -> Result<RuntimeInfo, Report<ExtractError>>;
}

/// cgroup based network classifier
///
/// Groups are named after the pid they were created for and live below a single
/// base cgroup.
pub trait CgroupClassifier: Send + Sync {
    fn create_group(&self, cgroup: &str) -> ClassifierResult<()>;

    /// Deleting a group that does not exist succeeds.
    fn delete_group(&self, cgroup: &str) -> ClassifierResult<()>;

    fn assign_mark(&self, cgroup: &str, mark: u32) -> ClassifierResult<()>;

    fn add_process(&self, cgroup: &str, pid: u32) -> ClassifierResult<()>;

    /// Names of all groups below the base cgroup
    fn list_groups(&self) -> ClassifierResult<Vec<String>>;

    /// Live member processes of a group
    fn list_group_members(&self, cgroup: &str) -> ClassifierResult<Vec<u32>>;

    /// Mark assigned to a group, `None` when never assigned
    fn mark_of(&self, cgroup: &str) -> ClassifierResult<Option<String>>;

    /// Remove the base cgroup itself
    fn delete_base_path(&self, base: &str) -> ClassifierResult<()>;
}

/// Telemetry sink, fire and forget
pub trait EventCollector: Send + Sync {
    fn collect_container_event(&self, record: ContainerRecord);
}
