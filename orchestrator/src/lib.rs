//! optimizerd library
//!
//! Core modules for the remote optimization job orchestrator.

pub mod app;
pub mod bootstrap;
pub mod cloud;
pub mod errors;
pub mod filesys;
pub mod jobs;
pub mod keys;
pub mod logs;
pub mod notify;
pub mod remote;
pub mod server;
pub mod storage;
pub mod utils;
pub mod workers;
