use std::sync::Arc;

use error_stack::ResultExt;

use crate::config::ControllerConfig;
use crate::domain::pu_management::{
    LifecycleController, MetadataExtractor, MonitorError, MonitorResult, PolicyHandler,
};
use crate::infrastructure::collector::MetricsCollector;
use crate::infrastructure::netcls::NetClsController;

/// Controller wired to the host's net_cls hierarchy and the metrics log
pub type HostController<P, E> = LifecycleController<P, E, NetClsController, MetricsCollector>;

/// Wires a [`LifecycleController`] to the host from a [`ControllerConfig`].
///
/// The policy handler and the metadata extractor are supplied by the embedding
/// enforcer.
pub struct ControllerBuilder<P, E> {
    config: ControllerConfig,
    policy: Arc<P>,
    extractor: Arc<E>,
    host: Option<String>,
}

impl<P, E> ControllerBuilder<P, E>
where
    P: PolicyHandler,
    E: MetadataExtractor,
{
    pub fn new(config: ControllerConfig, policy: Arc<P>, extractor: Arc<E>) -> Self {
        Self {
            config,
            policy,
            extractor,
            host: None,
        }
    }

    /// Host name added to every container event record
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Build the controller and reconcile it with the state left by a previous
    /// instance.
    pub fn build(self) -> MonitorResult<HostController<P, E>> {
        let controller = self.build_without_resync()?;
        controller.resync()?;
        Ok(controller)
    }

    pub fn build_without_resync(self) -> MonitorResult<HostController<P, E>> {
        tracing::info!(
            store = %self.config.store_path.display(),
            base_cgroup = %self.config.base_cgroup,
            "Building lifecycle controller"
        );

        let store = self
            .config
            .open_store()
            .change_context(MonitorError::StoreUnavailable)?;

        LifecycleController::new(
            store,
            &self.config.base_cgroup,
            self.policy,
            self.extractor,
            Arc::new(self.config.netcls()),
            Arc::new(MetricsCollector::new(self.host)),
        )
    }
}
