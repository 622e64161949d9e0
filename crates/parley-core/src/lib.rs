pub mod config;
pub mod error;
pub mod http;
pub mod metering;
pub mod model;
pub mod orchestrator;
pub mod retrieval;
pub mod safety;
pub mod store;
pub mod tools;
pub mod types;
pub mod webhooks;
