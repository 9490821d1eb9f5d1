//! Error contexts for the processing-unit lifecycle

use core::error::Error;

use derive_more::Display;
use error_stack::Report;

use super::types::PuEvent;

/// Result type for lifecycle operations
pub type MonitorResult<T> = Result<T, Report<MonitorError>>;

/// Errors surfaced by the lifecycle controller and the resync reconciler
#[derive(Debug, Display)]
pub enum MonitorError {
    /// The event failed validation before any state was touched
    #[display("Invalid lifecycle event")]
    InvalidEvent,

    #[display("Metadata extraction failed for {context_id}")]
    Metadata { context_id: String },

    #[display("Policy handler rejected {event} for {context_id}")]
    Policy { context_id: String, event: PuEvent },

    #[display("Failed to classify cgroup {cgroup}")]
    Classification { cgroup: String },

    #[display("Mark value not found for cgroup {cgroup}")]
    MissingMark { cgroup: String },

    #[display("Mark value `{mark}` for cgroup {cgroup} is not a valid classid")]
    InvalidMark { cgroup: String, mark: String },

    #[display("Membership cache rejected the transition")]
    Membership,

    #[display("Context store operation failed for {context_id}")]
    Store { context_id: String },

    #[display("Context store is not available")]
    StoreUnavailable,

    #[display("Unable to enumerate live state for resync")]
    ResyncUnavailable,

    #[display("Invalid base cgroup `{base}`")]
    InvalidBaseCgroup { base: String },
}

impl Error for MonitorError {}

/// Errors reported by the policy enforcement handler
#[derive(Debug, Display)]
pub enum PolicyError {
    #[display("Policy handler unavailable: {message}")]
    Unavailable { message: String },

    #[display("Policy handler rejected the request: {message}")]
    Rejected { message: String },
}

impl Error for PolicyError {}

/// Errors reported by runtime metadata extraction
#[derive(Debug, Display)]
pub enum ExtractError {
    #[display("Invalid event metadata: {message}")]
    InvalidMetadata { message: String },
}

impl Error for ExtractError {}

/// Errors reported by the cgroup network classifier
#[derive(Debug, Display)]
pub enum ClassifierError {
    #[display("Failed to create cgroup {cgroup}")]
    Create { cgroup: String },

    #[display("Failed to delete cgroup {cgroup}")]
    Delete { cgroup: String },

    #[display("Failed to assign mark {mark} to cgroup {cgroup}")]
    AssignMark { cgroup: String, mark: u32 },

    #[display("Failed to add process {pid} to cgroup {cgroup}")]
    AddProcess { cgroup: String, pid: u32 },

    #[display("Failed to enumerate cgroups")]
    Enumerate,

    #[display("Failed to read cgroup {cgroup}")]
    Read { cgroup: String },
}

impl Error for ClassifierError {}
