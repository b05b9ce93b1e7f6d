pub mod analyzer;
pub mod budget;
pub mod cli;
pub mod config;
pub mod convergence;
pub mod error;
pub mod experiment_log;
pub mod inference;
pub mod orchestrator;
pub mod phases;
pub mod process;
pub mod prompts;
pub mod pytest;
pub mod sandbox;
pub mod schema;
pub mod state;
