//! Retry-aware execution engine.
//!
//! One call to [`Executor::execute`] is one run:
//!
//! 1. insert the run row in `running` state before anything else happens
//! 2. open the run's output capture and build its [`AgentContext`]
//! 3. call the agent up to `1 + retries` times, with no delay between attempts
//! 4. flush state, drain output, and write the terminal row
//!
//! Recoverable failures (errors and panics from the agent) end up in the
//! run's `error` field. Interruptions are not retried; they are recorded and
//! then returned as [`ExecuteError::Interrupted`]. Storage errors propagate
//! as-is, which can leave the row in `running`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::agent::capture::OutputCapture;
use crate::agent::context::AgentContext;
use crate::agent::model::{Agent, AgentResult};
use crate::error::{AgentError, ExecuteError};
use crate::store::{Run, RunStatus, Store};

/// Default number of earlier runs exposed through `AgentContext::history`.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Runs agents and records what happened.
#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn Store>,
    history_limit: usize,
    passthrough: bool,
    cancel: Option<CancellationToken>,
}

impl Executor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            history_limit: DEFAULT_HISTORY_LIMIT,
            passthrough: true,
            cancel: None,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Keep captured output off the process stdout.
    pub fn silent(mut self) -> Self {
        self.passthrough = false;
        self
    }

    /// Cancelling `token` interrupts the attempt in flight.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Run `agent` once (with retries) and return the finished run.
    pub async fn execute(&self, agent: &Agent) -> Result<Run, ExecuteError> {
        let run_id = new_run_id();
        let span = tracing::info_span!("agent_run", agent = %agent.name, run_id = %run_id);
        self.execute_run(agent, run_id, span.clone())
            .instrument(span)
            .await
    }

    async fn execute_run(
        &self,
        agent: &Agent,
        run_id: String,
        span: tracing::Span,
    ) -> Result<Run, ExecuteError> {
        let mut run = Run::start(&run_id, &agent.name);
        self.store.insert_run(&run).await?;

        let capture = if self.passthrough {
            OutputCapture::new()
        } else {
            OutputCapture::silent()
        };
        let mut ctx = AgentContext::new(
            &agent.name,
            &run_id,
            self.store.clone(),
            capture.clone(),
            span,
            self.history_limit,
        );

        let attempts = agent.retries.saturating_add(1);
        let mut last_error: Option<String> = None;
        let mut interruption: Option<String> = None;

        for attempt in 1..=attempts {
            match self.attempt(agent, &mut ctx).await {
                Ok(result) => {
                    run.status = RunStatus::Success;
                    run.result = result;
                    last_error = None;
                    break;
                }
                Err(AgentError::Interrupted(reason)) => {
                    tracing::warn!(attempt, reason = %reason, "agent_interrupted");
                    interruption = Some(reason);
                    break;
                }
                Err(AgentError::Failed(e)) => {
                    let message = e.to_string();
                    if attempt < attempts {
                        tracing::warn!(attempt, error = %message, "agent_retry");
                    } else {
                        tracing::error!(attempt, error = %message, "agent_failed");
                    }
                    last_error = Some(message);
                }
            }
        }

        // Finalization runs for every outcome above.
        ctx.state.flush().await?;
        run.output = capture.finish();
        let finished_at = Utc::now();
        run.finished_at = Some(finished_at);
        run.duration_ms = (finished_at - run.started_at)
            .num_microseconds()
            .map(|us| us as f64 / 1000.0);
        if let Some(reason) = &interruption {
            run.status = RunStatus::Error;
            run.error = Some(format!("Interrupted: {reason}"));
        } else if let Some(message) = last_error {
            run.status = RunStatus::Error;
            run.error = Some(message);
        }
        self.store.update_run(&run).await?;

        tracing::info!(
            status = %run.status,
            result = run.result.as_deref().unwrap_or(""),
            duration_ms = run.duration_ms.unwrap_or_default().round() as u64,
            "agent_finished"
        );

        match interruption {
            Some(reason) => Err(ExecuteError::Interrupted {
                run: Box::new(run),
                reason,
            }),
            None => Ok(run),
        }
    }

    /// One call of the agent, racing the cancellation token if there is one.
    async fn attempt(&self, agent: &Agent, ctx: &mut AgentContext) -> AgentResult {
        let call = AssertUnwindSafe(agent.handler.call(ctx)).catch_unwind();
        let outcome = match &self.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return Err(AgentError::Interrupted("cancelled".to_string()));
                }
                outcome = call => outcome,
            },
            None => call.await,
        };
        outcome.unwrap_or_else(|payload| {
            Err(AgentError::msg(format!(
                "panic: {}",
                panic_message(payload.as_ref())
            )))
        })
    }
}

/// Short hex id from a random v4 UUID.
fn new_run_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use crate::agent::model::AgentFn;
    use crate::store::LibSqlStore;

    async fn test_executor(agents: &[&str]) -> Executor {
        let store = LibSqlStore::new_memory().await.unwrap();
        for name in agents {
            store.sync_agent(name, None, 0).await.unwrap();
        }
        Executor::new(Arc::new(store)).silent()
    }

    /// Fails the first `failures` calls, then returns "ok".
    struct Flaky {
        failures: u32,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl AgentFn for Flaky {
        async fn call(&self, _ctx: &mut AgentContext) -> AgentResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err(AgentError::msg(format!("attempt {n} failed")));
            }
            Ok(Some("ok".to_string()))
        }
    }

    struct Counter;

    #[async_trait]
    impl AgentFn for Counter {
        async fn call(&self, ctx: &mut AgentContext) -> AgentResult {
            let count = ctx.state.get_as::<u64>("count").await?.unwrap_or(0) + 1;
            ctx.state.set("count", count).await?;
            Ok(Some(format!("count={count}")))
        }
    }

    #[test]
    fn run_ids_are_short_hex() {
        let id = new_run_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_run_id());
    }

    #[tokio::test]
    async fn succeeds_after_retries_with_one_row() {
        for retries in 0..4 {
            let executor = test_executor(&["flaky"]).await;
            let calls = Arc::new(AtomicU32::new(0));
            let agent = Agent::new(
                "flaky",
                Flaky {
                    failures: retries,
                    calls: calls.clone(),
                },
            )
            .with_retries(retries);

            let run = executor.execute(&agent).await.unwrap();
            assert_eq!(run.status, RunStatus::Success);
            assert_eq!(run.result.as_deref(), Some("ok"));
            assert!(run.error.is_none());
            assert_eq!(calls.load(Ordering::SeqCst), retries + 1);

            let rows = executor.store().get_runs("flaky", 10).await.unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].id, run.id);
            assert_eq!(rows[0].status, RunStatus::Success);
        }
    }

    #[tokio::test]
    async fn always_failing_keeps_only_last_error() {
        let executor = test_executor(&["flaky"]).await;
        let calls = Arc::new(AtomicU32::new(0));
        let agent = Agent::new(
            "flaky",
            Flaky {
                failures: u32::MAX,
                calls: calls.clone(),
            },
        )
        .with_retries(2);

        let run = executor.execute(&agent).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.error.as_deref(), Some("attempt 3 failed"));
        assert!(run.result.is_none());

        let stored = executor.store().get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Error);
        assert_eq!(stored.error.as_deref(), Some("attempt 3 failed"));
        assert!(stored.finished_at.is_some());
        assert!(stored.duration_ms.is_some());
    }

    #[tokio::test]
    async fn counter_persists_across_runs() {
        let executor = test_executor(&["counter"]).await;
        let agent = Agent::new("counter", Counter);

        let first = executor.execute(&agent).await.unwrap();
        let second = executor.execute(&agent).await.unwrap();
        assert_eq!(first.result.as_deref(), Some("count=1"));
        assert_eq!(second.result.as_deref(), Some("count=2"));

        let state = executor.store().get_state("counter").await.unwrap();
        assert_eq!(state["count"], json!(2));
    }

    #[tokio::test]
    async fn none_result_is_absent_and_empty_output_is_none() {
        let executor = test_executor(&["quiet"]).await;
        let agent = Agent::from_fn("quiet", |_ctx| Box::pin(async { Ok(None) }));

        let run = executor.execute(&agent).await.unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert!(run.result.is_none());
        assert!(run.output.is_none());
    }

    #[tokio::test]
    async fn output_is_captured() {
        let executor = test_executor(&["talker"]).await;
        let agent = Agent::from_fn("talker", |ctx| {
            Box::pin(async move {
                ctx.println("hello");
                ctx.print("world");
                Ok(None)
            })
        });

        let run = executor.execute(&agent).await.unwrap();
        assert_eq!(run.output.as_deref(), Some("hello\nworld"));
        let stored = executor.store().get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.output.as_deref(), Some("hello\nworld"));
    }

    #[tokio::test]
    async fn panic_is_a_recoverable_failure() {
        let executor = test_executor(&["boom"]).await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let agent = Agent::from_fn("boom", move |_ctx| {
            let calls = counter.clone();
            Box::pin(async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("kaboom");
                }
                Ok(Some("recovered".to_string()))
            })
        })
        .with_retries(1);

        let run = executor.execute(&agent).await.unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.result.as_deref(), Some("recovered"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn interruption_is_recorded_then_returned() {
        let executor = test_executor(&["stop"]).await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let agent = Agent::from_fn("stop", move |ctx| {
            let calls = counter.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                ctx.state.set("seen", true).await?;
                Err(AgentError::Interrupted("shutdown".to_string()))
            })
        })
        .with_retries(3);

        let err = executor.execute(&agent).await.unwrap_err();
        let ExecuteError::Interrupted { run, reason } = err else {
            panic!("expected interruption");
        };
        assert_eq!(reason, "shutdown");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.error.as_deref(), Some("Interrupted: shutdown"));

        let stored = executor.store().get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Error);
        // state was still flushed
        let state = executor.store().get_state("stop").await.unwrap();
        assert_eq!(state["seen"], json!(true));
    }

    #[tokio::test]
    async fn cancellation_interrupts_in_flight_attempt() {
        let token = CancellationToken::new();
        let executor = test_executor(&["sleepy"])
            .await
            .with_cancellation(token.clone());
        let agent = Agent::from_fn("sleepy", |ctx| {
            Box::pin(async move {
                ctx.println("going to sleep");
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                Ok(Some("woke".to_string()))
            })
        })
        .with_retries(5);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            token.cancel();
        });

        let err = executor.execute(&agent).await.unwrap_err();
        canceller.await.unwrap();
        let ExecuteError::Interrupted { run, .. } = err else {
            panic!("expected interruption");
        };
        assert_eq!(run.error.as_deref(), Some("Interrupted: cancelled"));
        assert_eq!(run.output.as_deref(), Some("going to sleep\n"));

        let stored = executor.store().get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Error);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn state_becomes_visible_only_after_run_ends() {
        let executor = test_executor(&["writer"]).await;
        let store = executor.store().clone();
        let agent = Agent::from_fn("writer", move |ctx| {
            let store = store.clone();
            Box::pin(async move {
                ctx.state.set("k", "v").await?;
                let visible = store.get_state("writer").await?;
                Ok(Some(visible.contains_key("k").to_string()))
            })
        });

        let run = executor.execute(&agent).await.unwrap();
        assert_eq!(run.result.as_deref(), Some("false"));
        let state = executor.store().get_state("writer").await.unwrap();
        assert_eq!(state["k"], json!("v"));
    }

    #[tokio::test]
    async fn failed_run_still_flushes_state() {
        let executor = test_executor(&["partial"]).await;
        let agent = Agent::from_fn("partial", |ctx| {
            Box::pin(async move {
                ctx.state.set("progress", 1).await?;
                Err(AgentError::msg("gave up"))
            })
        });

        let run = executor.execute(&agent).await.unwrap();
        assert_eq!(run.status, RunStatus::Error);
        let state = executor.store().get_state("partial").await.unwrap();
        assert_eq!(state["progress"], json!(1));
    }
}
