pub mod api;
pub mod config;
pub mod domain;
pub mod infra;
pub mod startup;

pub use api::routes::*;
pub use config::*;
pub use domain::*;
pub use infra::db::*;
pub use infra::pi::*;
#[cfg(any(feature = "e2e-testing", debug_assertions))]
pub use infra::pi_mock::MockPiProcessor;
pub use startup::*;
