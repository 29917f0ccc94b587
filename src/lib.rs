pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod features;
pub mod forecaster;
pub mod gbdt;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod service;
pub mod source;
pub mod trainer;
