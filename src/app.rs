//! `Watchd`: owns the store and the registered agents, syncs metadata,
//! and drives scheduled agents until shutdown.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::executor::Executor;
use crate::agent::model::Agent;
use crate::agent::registry::AgentRegistry;
use crate::agent::schedule::Schedule;
use crate::config::WatchdConfig;
use crate::error::{Error, ExecuteError, Result};
use crate::store::{AgentRecord, LibSqlStore, Run, Store};

pub struct Watchd {
    config: WatchdConfig,
    store: Arc<dyn Store>,
    registry: AgentRegistry,
    shutdown: CancellationToken,
}

impl Watchd {
    /// Install logging and open the configured database file.
    pub async fn open(config: WatchdConfig) -> Result<Self> {
        crate::logging::init(&config.log_level);
        let store = LibSqlStore::new_local(Path::new(&config.db)).await?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    pub fn with_store(config: WatchdConfig, store: Arc<dyn Store>) -> Self {
        Self {
            config,
            store,
            registry: AgentRegistry::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register one agent. Duplicate names replace the earlier agent.
    pub fn register(&mut self, agent: Agent) -> &mut Self {
        self.registry.register(agent);
        self
    }

    /// Register every agent from a registry.
    pub fn with_agents(mut self, registry: AgentRegistry) -> Self {
        for agent in registry.into_agents().into_values() {
            self.registry.register(agent);
        }
        self
    }

    pub fn agent(&self, name: &str) -> Option<&Agent> {
        self.registry.get(name)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Executor wired to this instance's store, config and shutdown token.
    pub fn executor(&self) -> Executor {
        Executor::new(self.store.clone())
            .with_history_limit(self.config.history_limit)
            .with_cancellation(self.shutdown.clone())
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop `start()` and interrupt runs in flight.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Upsert metadata for every registered agent.
    pub async fn sync_agents(&self) -> Result<()> {
        for agent in self.registry.iter() {
            let schedule = agent.schedule.as_ref().map(Schedule::to_string);
            self.store
                .sync_agent(&agent.name, schedule.as_deref(), agent.retries)
                .await?;
        }
        Ok(())
    }

    /// Run one agent immediately. Ctrl-C or [`Watchd::shutdown`] interrupts
    /// the run; its row is finalized before the error is returned.
    pub async fn run(&self, name: &str) -> Result<Run> {
        let agent = self
            .registry
            .get(name)
            .ok_or_else(|| Error::UnknownAgent(name.to_string()))?;
        self.sync_agents().await?;

        let executor = self.executor();
        let execution = executor.execute(agent);
        tokio::pin!(execution);
        let outcome = tokio::select! {
            outcome = &mut execution => outcome,
            Ok(()) = tokio::signal::ctrl_c() => {
                tracing::info!(agent = %name, "Interrupt received, finalizing run");
                self.shutdown.cancel();
                execution.await
            }
        };
        Ok(outcome?)
    }

    /// Fire scheduled agents until Ctrl-C or [`Watchd::shutdown`].
    pub async fn start(&self) -> Result<()> {
        self.sync_agents().await?;

        let executor = Arc::new(self.executor());
        let mut handles = Vec::new();
        for agent in self.registry.iter() {
            if let Some(schedule) = &agent.schedule {
                tracing::info!(agent = %agent.name, schedule = %schedule, "agent_scheduled");
                handles.push(spawn_ticker(
                    executor.clone(),
                    agent.clone(),
                    schedule.clone(),
                    self.shutdown.clone(),
                ));
            }
        }

        tracing::info!(agents = self.registry.len(), "watchd_started");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("shutting_down"),
            _ = self.shutdown.cancelled() => tracing::info!("shutdown_requested"),
        }
        self.shutdown.cancel();

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Ticker task failed: {e}");
            }
        }
        Ok(())
    }

    pub async fn recent_runs(&self, agent: &str, limit: usize) -> Result<Vec<Run>> {
        Ok(self.store.get_runs(agent, limit).await?)
    }

    pub async fn all_runs(&self, limit: usize) -> Result<Vec<Run>> {
        Ok(self.store.get_all_runs(limit).await?)
    }

    /// Agents known to storage, including ones no longer registered.
    pub async fn agents(&self) -> Result<Vec<AgentRecord>> {
        Ok(self.store.list_agents().await?)
    }
}

/// Sleep until the agent's next fire time, run it, repeat. Runs of one
/// agent never overlap.
fn spawn_ticker(
    executor: Arc<Executor>,
    agent: Agent,
    schedule: Schedule,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let next = match schedule.next_fire(now) {
                Ok(next) => next,
                Err(e) => {
                    tracing::error!(agent = %agent.name, "Cannot schedule agent: {e}");
                    return;
                }
            };
            let wait = (next - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            match executor.execute(&agent).await {
                Ok(run) => {
                    tracing::debug!(agent = %agent.name, run_id = %run.id, status = %run.status, "Scheduled run complete");
                }
                Err(ExecuteError::Interrupted { .. }) => return,
                Err(e) => {
                    tracing::error!(agent = %agent.name, "Scheduled run failed: {e}");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::store::RunStatus;

    async fn test_app() -> Watchd {
        let store = LibSqlStore::new_memory().await.unwrap();
        Watchd::with_store(WatchdConfig::default(), Arc::new(store))
    }

    fn echo(name: &str) -> Agent {
        Agent::from_fn(name, |ctx| {
            Box::pin(async move { Ok(Some(ctx.agent_name.clone())) })
        })
    }

    #[tokio::test]
    async fn run_syncs_and_executes() {
        let mut app = test_app().await;
        app.register(echo("hello").with_schedule(Schedule::every_minutes(5)).with_retries(2));

        let run = app.run("hello").await.unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.result.as_deref(), Some("hello"));

        let agents = app.agents().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].schedule.as_deref(), Some("every 5m"));
        assert_eq!(agents[0].retries, 2);
        assert_eq!(app.recent_runs("hello", 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_agent_is_an_error() {
        let app = test_app().await;
        assert!(matches!(
            app.run("nope").await,
            Err(Error::UnknownAgent(name)) if name == "nope"
        ));
    }

    #[tokio::test]
    async fn shutdown_during_manual_run_finalizes_row() {
        let mut app = test_app().await;
        app.register(Agent::from_fn("sleepy", |_ctx| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Some("woke".to_string()))
            })
        }));
        let token = app.shutdown_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let err = app.run("sleepy").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Execute(ExecuteError::Interrupted { ref reason, .. }) if reason == "cancelled"
        ));

        let rows = app.recent_runs("sleepy", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, RunStatus::Error);
        assert_eq!(rows[0].error.as_deref(), Some("Interrupted: cancelled"));
        assert!(rows[0].finished_at.is_some());
        assert!(rows[0].result.is_none());
    }

    #[tokio::test]
    async fn agents_from_registry() {
        let mut registry = AgentRegistry::new();
        registry.register(echo("a")).register(echo("b"));
        let app = test_app().await.with_agents(registry);
        app.sync_agents().await.unwrap();

        let names: Vec<_> = app
            .agents()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, ["a", "b"]);
        assert!(app.agent("a").is_some());
    }

    #[tokio::test]
    async fn start_fires_scheduled_agents_until_shutdown() {
        let mut app = test_app().await;
        app.register(echo("ticker").with_schedule(Schedule::every_seconds(1)));
        app.register(echo("manual"));
        let store = app.store().clone();
        let token = app.shutdown_token();

        let handle = tokio::spawn(async move { app.start().await });
        tokio::time::sleep(Duration::from_millis(1300)).await;
        token.cancel();
        handle.await.unwrap().unwrap();

        let ticks = store.get_runs("ticker", 100).await.unwrap();
        assert!(!ticks.is_empty());
        assert!(ticks.iter().all(|r| r.status.is_terminal()));
        assert!(store.get_runs("manual", 10).await.unwrap().is_empty());
    }
}
