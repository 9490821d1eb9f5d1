//! Processing-unit lifecycle management: membership tracking, the lifecycle state
//! machine driving the policy handler and the net_cls classifier, and crash
//! recovery.

pub mod controller;
pub mod error;
pub mod membership;
pub mod resync;
pub mod traits;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use controller::{
    EventOutcome, LifecycleController, StartOutcome, StopOutcome, TeardownFailure,
    TeardownReport, TeardownStep,
};
pub use error::{ClassifierError, ExtractError, MonitorError, MonitorResult, PolicyError};
pub use membership::MembershipCache;
pub use resync::{collect_live_marks, LiveMarks, ReplayFailure, ResyncReport};
pub use traits::{
    CgroupClassifier, ClassifierResult, EventCollector, MetadataExtractor, PolicyHandler,
};
pub use types::{
    parse_pid, ContainerEvent, ContainerRecord, ContextId, IdentifierError, MembershipEntry,
    MembershipError, MembershipStats, PuEvent, RuntimeInfo, RuntimeOptions, StoredContext,
    UnitIdentity,
};
