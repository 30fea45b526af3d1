//! Service layer.
//!
//! - [`api`] - The [`AddressService`] capability and its [`Controller`]

pub mod api;

pub use api::{AddressService, Controller, ControllerOptions, RestoreSummary};
