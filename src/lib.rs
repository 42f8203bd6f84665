//! watchd: run small agents on demand or on a schedule, and keep a durable
//! record of every run plus each agent's key/value memory.

pub mod agent;
pub mod app;
pub mod config;
pub mod error;
pub mod logging;
pub mod store;

pub use agent::{Agent, AgentContext, AgentFn, AgentRegistry, AgentResult, Executor, Schedule};
pub use app::Watchd;
pub use config::WatchdConfig;
pub use error::{AgentError, Error, ExecuteError, Result};
pub use store::{LibSqlStore, Run, RunStatus, Store};
