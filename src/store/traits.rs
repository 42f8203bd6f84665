//! `Store` trait: single async interface for agents, runs, and agent state.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Error,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::Error => write!(f, "error"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One logical execution of an agent, spanning all of its attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub agent: String,
    pub status: RunStatus,
    pub result: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<f64>,
}

impl Run {
    /// A fresh run in `running` state, started now.
    pub fn start(id: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent: agent.into(),
            status: RunStatus::Running,
            result: None,
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
        }
    }
}

/// Persisted agent metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    pub schedule: Option<String>,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Backend-agnostic storage trait.
///
/// Every mutating call commits before returning.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create tables and indexes. Safe to call repeatedly.
    async fn init_schema(&self) -> Result<(), StoreError>;

    // ── Agents ──────────────────────────────────────────────────────

    /// Insert or update agent metadata. The last write for a name wins.
    async fn sync_agent(
        &self,
        name: &str,
        schedule: Option<&str>,
        retries: u32,
    ) -> Result<(), StoreError>;

    /// All known agents, ordered by name.
    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError>;

    // ── Runs ────────────────────────────────────────────────────────

    async fn insert_run(&self, run: &Run) -> Result<(), StoreError>;

    /// Write the mutable fields of a run back to its row.
    async fn update_run(&self, run: &Run) -> Result<(), StoreError>;

    async fn get_run(&self, id: &str) -> Result<Option<Run>, StoreError>;

    /// Most recent runs for one agent, newest first.
    async fn get_runs(&self, agent: &str, limit: usize) -> Result<Vec<Run>, StoreError>;

    /// Most recent runs across all agents, newest first.
    async fn get_all_runs(&self, limit: usize) -> Result<Vec<Run>, StoreError>;

    // ── State ───────────────────────────────────────────────────────

    /// Full state mapping for an agent. Malformed values are an error.
    async fn get_state(
        &self,
        agent: &str,
    ) -> Result<HashMap<String, serde_json::Value>, StoreError>;

    async fn set_state(
        &self,
        agent: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Upsert many keys in one transaction.
    async fn set_state_bulk(
        &self,
        agent: &str,
        entries: &HashMap<String, serde_json::Value>,
    ) -> Result<(), StoreError>;

    /// Delete keys in one transaction. Missing keys are ignored.
    async fn delete_state_keys(
        &self,
        agent: &str,
        keys: &HashSet<String>,
    ) -> Result<(), StoreError>;
}
