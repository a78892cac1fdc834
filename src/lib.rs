pub mod access;
pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod shutdown;
pub mod store;

pub use error::{Result, SchedulerError};
pub use scheduler::Scheduler;
