//! Bootstrap for processes embedding the coordination layer
//!
//! This module handles:
//! - Configuration loading
//! - Store connections (Redis or in-memory) bundled into a `StoreContext`

pub mod config;
pub mod context;

pub use config::load_config;
pub use context::StoreContext;
