//! Per-run context handed to agent callables.

use std::fmt::Display;
use std::sync::Arc;

use tracing::Span;

use crate::agent::capture::OutputCapture;
use crate::agent::state::StateProxy;
use crate::error::StoreError;
use crate::store::{Run, Store};

/// Logger bound to one agent and run id.
///
/// Events go to the tracing subscriber inside the run's span and are also
/// recorded in the run's captured output.
#[derive(Debug, Clone)]
pub struct RunLogger {
    span: Span,
    capture: OutputCapture,
}

impl RunLogger {
    pub(crate) fn new(span: Span, capture: OutputCapture) -> Self {
        Self { span, capture }
    }

    pub fn debug(&self, message: impl Display) {
        self.span.in_scope(|| tracing::debug!("{message}"));
        self.capture.record(&format!("[debug] {message}\n"));
    }

    pub fn info(&self, message: impl Display) {
        self.span.in_scope(|| tracing::info!("{message}"));
        self.capture.record(&format!("[info] {message}\n"));
    }

    pub fn warn(&self, message: impl Display) {
        self.span.in_scope(|| tracing::warn!("{message}"));
        self.capture.record(&format!("[warn] {message}\n"));
    }

    pub fn error(&self, message: impl Display) {
        self.span.in_scope(|| tracing::error!("{message}"));
        self.capture.record(&format!("[error] {message}\n"));
    }
}

/// Everything an agent sees while it runs.
pub struct AgentContext {
    pub agent_name: String,
    pub run_id: String,
    pub log: RunLogger,
    /// The agent's durable memory. Flushed by the executor when the run ends.
    pub state: StateProxy,
    output: OutputCapture,
    store: Arc<dyn Store>,
    history_limit: usize,
}

impl AgentContext {
    pub(crate) fn new(
        agent_name: &str,
        run_id: &str,
        store: Arc<dyn Store>,
        output: OutputCapture,
        span: Span,
        history_limit: usize,
    ) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            run_id: run_id.to_string(),
            log: RunLogger::new(span, output.clone()),
            state: StateProxy::new(store.clone(), agent_name),
            output,
            store,
            history_limit,
        }
    }

    /// Write text to this run's output.
    pub fn print(&self, text: impl Display) {
        self.output.write_str(&text.to_string());
    }

    pub fn println(&self, text: impl Display) {
        self.output.write_str(&format!("{text}\n"));
    }

    /// Handle to this run's output, usable with `write!`.
    pub fn output(&self) -> OutputCapture {
        self.output.clone()
    }

    /// Most recent earlier runs of this agent, newest first.
    pub async fn history(&self) -> Result<Vec<Run>, StoreError> {
        let mut runs = self
            .store
            .get_runs(&self.agent_name, self.history_limit.saturating_add(1))
            .await?;
        runs.retain(|run| run.id != self.run_id);
        runs.truncate(self.history_limit);
        Ok(runs)
    }
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("agent_name", &self.agent_name)
            .field("run_id", &self.run_id)
            .field("state", &self.state)
            .finish()
    }
}
