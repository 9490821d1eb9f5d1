pub mod cli;
pub mod monitor;

use std::path::PathBuf;

use crate::infrastructure::context_store::{ContextStore, ContextStoreResult};
use crate::infrastructure::netcls::NetClsController;

/// Settings needed to wire a lifecycle controller to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub store_path: PathBuf,
    pub netcls_root: PathBuf,
    pub base_cgroup: String,
    pub release_agent: Option<PathBuf>,
}

impl From<&monitor::MonitorArgs> for ControllerConfig {
    fn from(args: &monitor::MonitorArgs) -> Self {
        Self {
            store_path: args.store_path.clone(),
            netcls_root: args.netcls_root.clone(),
            base_cgroup: args.base_cgroup.clone(),
            release_agent: args.release_agent.clone(),
        }
    }
}

impl ControllerConfig {
    pub fn open_store(&self) -> ContextStoreResult<ContextStore> {
        ContextStore::open(&self.store_path)
    }

    pub fn netcls(&self) -> NetClsController {
        NetClsController::new(
            &self.netcls_root,
            &self.base_cgroup,
            self.release_agent.clone(),
        )
    }
}

pub use cli::*;
pub use monitor::*;
