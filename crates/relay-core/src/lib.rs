pub mod config;
pub mod env_file;
pub mod plan;
pub mod plan_watcher;
pub mod types;
