//! Kiln - incremental work orchestration
//!
//! Named actions declare their input and output values. A [`Dispatcher`]
//! builds the dependency graph for the values requested, runs only the actions
//! whose content-addressed cache entries are missing or stale, and records
//! the results on disk. A [`CacheManager`] evicts entries nothing relies on.

pub mod action;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod graph;
pub mod hash;
pub mod maintenance;
pub mod store;
pub mod util;
pub mod value;

pub use action::{Action, FnAction};
pub use dispatcher::Dispatcher;
pub use error::{ActionError, KilnError, KilnResult};
pub use graph::DispatchReport;
pub use maintenance::{CacheManager, Eviction, EvictionReport, MaintenanceOutcome, MaintenancePolicy};
pub use store::{LockOptions, LockRegistry};
pub use value::{OutputKind, Value};
