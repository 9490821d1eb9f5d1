//! Dual-index membership cache
//!
//! Tracks every active processing unit together with its member processes, and
//! keeps the reverse mapping from host pid to owning unit that the stop path needs
//! when only the released process is known.
//!
//! The cache carries no lock of its own. The lifecycle controller owns it behind a
//! single mutex held for the whole of each mutating event, so both indices always
//! change together.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use tracing::info;

use super::types::{
    ContextId, MembershipEntry, MembershipError, MembershipStats, RuntimeInfo, UnitIdentity,
};

type Result<T> = std::result::Result<T, MembershipError>;

/// In-memory view of all active processing units
#[derive(Debug, Default)]
pub struct MembershipCache {
    /// Active units, keyed by raw context id
    units: HashMap<ContextId, MembershipEntry>,
    /// Reverse mapping from host pid to owning unit
    pid_to_unit: HashMap<u32, ContextId>,
}

impl MembershipCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a never-seen unit with its first member process.
    pub fn register_unit(
        &mut self,
        identity: UnitIdentity,
        runtime: Arc<RuntimeInfo>,
        pid: u32,
    ) -> Result<()> {
        let context_id = identity.context_id().clone();
        if self.units.contains_key(&context_id) {
            return Err(MembershipError::UnitAlreadyRegistered { context_id });
        }
        self.ensure_pid_available(&context_id, pid)?;

        let mut entry = MembershipEntry::new(identity, runtime);
        entry.add_process(pid);
        self.units.insert(context_id.clone(), entry);
        self.pid_to_unit.insert(pid, context_id.clone());

        info!(
            context_id = %context_id,
            pid = pid,
            "Processing unit registered in membership cache"
        );

        Ok(())
    }

    /// Add a process to an already active unit.
    ///
    /// Adding a process that is already a member is a no-op.
    pub fn add_process(&mut self, context_id: &ContextId, pid: u32) -> Result<()> {
        self.ensure_pid_available(context_id, pid)?;

        let entry =
            self.units
                .get_mut(context_id)
                .ok_or_else(|| MembershipError::UnitNotFound {
                    context_id: context_id.clone(),
                })?;
        entry.add_process(pid);
        self.pid_to_unit.insert(pid, context_id.clone());

        debug!(
            context_id = %context_id,
            pid = pid,
            members = entry.processes.len(),
            "Process joined processing unit"
        );

        Ok(())
    }

    /// Remove a process from its unit and from the pid index.
    ///
    /// Returns the number of member processes left in the unit. The unit itself
    /// is kept even when it becomes empty, see [`MembershipCache::remove_unit`].
    pub fn release_process(&mut self, context_id: &ContextId, pid: u32) -> Result<usize> {
        let entry =
            self.units
                .get_mut(context_id)
                .ok_or_else(|| MembershipError::UnitNotFound {
                    context_id: context_id.clone(),
                })?;

        if !entry.remove_process(pid) {
            return Err(MembershipError::ProcessNotMember {
                pid,
                context_id: context_id.clone(),
            });
        }
        self.pid_to_unit.remove(&pid);

        let remaining = entry.processes.len();
        debug!(
            context_id = %context_id,
            pid = pid,
            remaining = remaining,
            "Process released from processing unit"
        );

        Ok(remaining)
    }

    /// Drop a unit whose member set is empty.
    pub fn remove_unit(&mut self, context_id: &ContextId) -> Result<MembershipEntry> {
        let members = self
            .units
            .get(context_id)
            .map(|entry| entry.processes.len())
            .ok_or_else(|| MembershipError::UnitNotFound {
                context_id: context_id.clone(),
            })?;

        if members != 0 {
            return Err(MembershipError::UnitNotEmpty {
                context_id: context_id.clone(),
                members,
            });
        }

        let entry = self
            .units
            .remove(context_id)
            .ok_or_else(|| MembershipError::UnitNotFound {
                context_id: context_id.clone(),
            })?;

        info!(context_id = %context_id, "Processing unit removed from membership cache");

        Ok(entry)
    }

    /// Get the unit a process belongs to
    pub fn unit_for_pid(&self, pid: u32) -> Option<&ContextId> {
        self.pid_to_unit.get(&pid)
    }

    pub fn get(&self, context_id: &ContextId) -> Option<&MembershipEntry> {
        self.units.get(context_id)
    }

    pub fn contains_unit(&self, context_id: &ContextId) -> bool {
        self.units.contains_key(context_id)
    }

    /// Member pids of a unit, empty for unknown units
    pub fn unit_processes(&self, context_id: &ContextId) -> Vec<u32> {
        self.units
            .get(context_id)
            .map(MembershipEntry::pids)
            .unwrap_or_default()
    }

    pub fn stats(&self) -> MembershipStats {
        MembershipStats {
            total_units: self.units.len(),
            total_processes: self.pid_to_unit.len(),
        }
    }

    fn ensure_pid_available(&self, context_id: &ContextId, pid: u32) -> Result<()> {
        match self.pid_to_unit.get(&pid) {
            Some(owner) if owner != context_id => Err(MembershipError::ProcessOwnedByOtherUnit {
                pid,
                owner: owner.clone(),
            }),
            _ => Ok(()),
        }
    }
}
