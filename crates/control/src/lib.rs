pub mod applier;
pub mod audit;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod inventory;
pub mod job_store;
pub mod lease;
pub mod metrics;
pub mod persist;
pub mod plane;
pub mod query;
pub mod reconcile;
pub mod validator;
pub mod web;

pub use config::ControlConfig;
pub use plane::ControlPlane;
