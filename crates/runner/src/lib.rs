//! Command-line runner for the workflow engine.
//!
//! Wires a transaction log (PostgreSQL or in-memory), the in-memory
//! reference modules and the commerce workflows into one engine, resumes
//! whatever a previous process left unfinished and runs one command.

pub mod app;
pub mod cli;
pub mod config;
pub mod error;

pub use app::{Engine, Modules, Runner, open_log};
pub use cli::{Cli, Command};
pub use config::{Config, LogFormat};
pub use error::{Result, RunnerError};
