//! Scenario shell for tiersync.
//!
//! Loads [`AppConfig`], builds the [`ScenarioRegistry`], initializes every
//! scenario and serves them over HTTP.

pub mod config;
pub mod observability;
pub mod registry;
pub mod routes;
pub mod scenario;
pub mod scenarios;
pub mod server;

pub use config::{AppConfig, ConfigError};
pub use registry::{RegistryError, ScenarioRegistry};
pub use scenario::{Action, DashboardComponent, Scenario, ScenarioError};
pub use server::{TiersyncServer, build_app};
