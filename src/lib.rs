pub mod agent;
pub mod cli;
pub mod config;
pub mod context;
pub mod database;
pub mod error;
pub mod orchestrator;
pub mod persistence;
pub mod safety;
pub mod sql;
pub mod test_utils;
pub mod types;
