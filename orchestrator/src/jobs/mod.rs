//! Job lifecycle: records, state machine, durable store, the background
//! driver and the stale-job reconciler

pub mod archive;
pub mod context;
pub mod dependencies;
pub mod driver;
pub mod fsm;
pub mod manager;
pub mod model;
pub mod persist;
pub mod reconcile;
pub mod runtime;
pub mod script;
pub mod store;
