//! Persistence layer: libSQL-backed storage for agents, runs, and agent state.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{AgentRecord, Run, RunStatus, Store};
