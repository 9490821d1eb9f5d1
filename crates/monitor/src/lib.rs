pub mod app_builder;
pub mod config;
mod domain;
mod infrastructure;

// Re-export main modules
pub use domain::pu_management;
pub use infrastructure::collector;
pub use infrastructure::context_store;
pub use infrastructure::logging;
pub use infrastructure::netcls;
