//! Local HTTP surface over the job manager

pub mod handlers;
pub mod serve;
pub mod state;
