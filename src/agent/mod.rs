//! Agent module: descriptors, per-run context, state proxy, output capture,
//! and the retry-aware executor.

pub mod capture;
pub mod context;
pub mod executor;
pub mod model;
pub mod registry;
pub mod schedule;
pub mod state;

pub use capture::OutputCapture;
pub use context::{AgentContext, RunLogger};
pub use executor::Executor;
pub use model::{Agent, AgentFn, AgentResult};
pub use registry::AgentRegistry;
pub use schedule::Schedule;
pub use state::StateProxy;
