//! Agent descriptor: a named callable with a retry count and optional schedule.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::agent::context::AgentContext;
use crate::agent::schedule::Schedule;
use crate::error::AgentError;

/// What one attempt returns: an optional result text, or a failure.
pub type AgentResult = Result<Option<String>, AgentError>;

/// The callable behind an agent.
#[async_trait]
pub trait AgentFn: Send + Sync {
    async fn call(&self, ctx: &mut AgentContext) -> AgentResult;
}

/// Adapter for closures returning boxed futures.
struct FnAgent<F>(F);

#[async_trait]
impl<F> AgentFn for FnAgent<F>
where
    F: for<'a> Fn(&'a mut AgentContext) -> BoxFuture<'a, AgentResult> + Send + Sync,
{
    async fn call(&self, ctx: &mut AgentContext) -> AgentResult {
        (self.0)(ctx).await
    }
}

/// A registered agent. Immutable for the duration of a run.
#[derive(Clone)]
pub struct Agent {
    pub name: String,
    pub handler: Arc<dyn AgentFn>,
    pub schedule: Option<Schedule>,
    /// Extra attempts after the first failure.
    pub retries: u32,
}

impl Agent {
    pub fn new(name: impl Into<String>, handler: impl AgentFn + 'static) -> Self {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            schedule: None,
            retries: 0,
        }
    }

    /// Build an agent from a closure, e.g.
    /// `Agent::from_fn("ping", |ctx| Box::pin(async move { ctx.println("pong"); Ok(None) }))`.
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut AgentContext) -> BoxFuture<'a, AgentResult>
            + Send
            + Sync
            + 'static,
    {
        Self::new(name, FnAgent(f))
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .field("retries", &self.retries)
            .finish()
    }
}
