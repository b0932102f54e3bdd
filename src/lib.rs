#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod queue;
pub mod scheduler;
pub mod security;
pub mod service;
pub mod store;

pub use config::Config;
pub use error::{CampanileError, Result};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use service::ServiceManager;
