pub mod agent;
pub mod analysis;
pub mod clap_args;
pub mod config;
pub mod control;
pub mod errors;
pub mod infra;
pub mod launcher;
pub mod range;
pub mod scheduler;
pub mod workload;
