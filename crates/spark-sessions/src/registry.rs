use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use spark_recovery::TaskError;
use tracing::{info, warn};

use crate::context::TaskContext;
use crate::error::{Result, SessionError};

/// The unit of work a job runs. `args` is the job's opaque argument map.
///
/// Implementations should call [`TaskContext::checkpoint`] between phases;
/// that is where cancellation is observed.
#[async_trait]
pub trait TaskFunction: Send + Sync {
    async fn run(&self, ctx: TaskContext, args: Value) -> std::result::Result<Value, TaskError>;
}

#[async_trait]
impl<F, Fut> TaskFunction for F
where
    F: Fn(TaskContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Value, TaskError>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext, args: Value) -> std::result::Result<Value, TaskError> {
        (self)(ctx, args).await
    }
}

/// Name → task function lookup shared by the scheduler and the daemon.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<dyn TaskFunction>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task` under `name`. Re-registering a name replaces the
    /// previous function.
    pub fn register(&self, name: &str, task: Arc<dyn TaskFunction>) -> Result<()> {
        validate_name(name)?;
        let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
        if tasks.insert(name.to_string(), task).is_some() {
            warn!(task = name, "task function replaced");
        } else {
            info!(task = name, "task function registered");
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskFunction>> {
        self.tasks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tasks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Names are persisted in the job store, so keep them to a conservative
/// identifier alphabet.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(SessionError::InvalidTaskName(format!(
            "name must be 1-64 characters: {name:?}"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(SessionError::InvalidTaskName(format!(
            "only [A-Za-z0-9_.-] allowed: {name:?}"
        )));
    }
    Ok(())
}
