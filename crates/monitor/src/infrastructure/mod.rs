pub mod collector;
pub mod context_store;
pub mod logging;
pub mod netcls;
