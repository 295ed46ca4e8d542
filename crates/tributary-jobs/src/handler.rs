//! Task handlers for each task kind.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use tributary_core::{Error, Result, TaskEnvelope, TaskKind};

/// Context provided to task handlers.
pub struct TaskContext {
    /// The task being processed.
    pub task: TaskEnvelope,
}

impl TaskContext {
    /// Create a new task context.
    pub fn new(task: TaskEnvelope) -> Self {
        Self { task }
    }

    pub fn task_id(&self) -> Uuid {
        self.task.id
    }

    /// Deserialize the task's keyword arguments.
    pub fn kwargs<T: DeserializeOwned>(&self) -> Result<T> {
        self.task.kwargs()
    }

    /// Identity written into locks taken on behalf of this delivery.
    pub fn holder_id(&self) -> String {
        holder_id(&self.task)
    }
}

/// Lock holder identity for one delivery of a task.
///
/// The attempt counter is part of the identity so a redelivered task never
/// releases a lock still held by its own earlier, timed-out attempt.
pub fn holder_id(task: &TaskEnvelope) -> String {
    format!("{}#{}", task.id, task.attempts)
}

/// Result of task execution.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    /// Task completed successfully with optional result data.
    Success(Option<JsonValue>),
    /// Task was not run (lock busy, resource gone). Never retried.
    Rejected(String),
    /// Task should be retried after the policy's backoff delay.
    Retry(String),
    /// Task failed permanently and goes to the dead-letter list.
    Failed(String),
}

impl TaskResult {
    /// Classify an error: transient failures are retried, the rest are fatal.
    pub fn from_error(error: &Error) -> Self {
        if error.is_transient() {
            TaskResult::Retry(error.to_string())
        } else {
            TaskResult::Failed(error.to_string())
        }
    }

    /// Collapse a handler body's `Result` into a task result.
    pub fn from_result(result: Result<TaskResult>) -> Self {
        result.unwrap_or_else(|e| Self::from_error(&e))
    }
}

/// Trait for task handlers.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The task kind this handler processes.
    fn kind(&self) -> TaskKind;

    /// Execute the task.
    async fn execute(&self, ctx: TaskContext) -> TaskResult;

    /// Called after `execute` was cancelled by the worker's hard time limit.
    ///
    /// Handlers that hold a lock or own a state machine record the failed
    /// attempt here. The default hands the task back to the retry policy.
    async fn on_timeout(&self, task: &TaskEnvelope) -> TaskResult {
        TaskResult::Retry(format!("{} exceeded its time limit", task.kind))
    }

    /// Check if this handler can process the given task kind.
    fn can_handle(&self, kind: TaskKind) -> bool {
        self.kind() == kind
    }
}

/// No-op handler for testing.
pub struct NoOpHandler {
    kind: TaskKind,
}

impl NoOpHandler {
    /// Create a new no-op handler for the given task kind.
    pub fn new(kind: TaskKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl TaskHandler for NoOpHandler {
    fn kind(&self) -> TaskKind {
        self.kind
    }

    async fn execute(&self, _ctx: TaskContext) -> TaskResult {
        TaskResult::Success(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde::Deserialize;
    use serde_json::json;
    use tributary_core::{FetchError, Lane, TaskStatus};

    fn envelope(kwargs: JsonValue) -> TaskEnvelope {
        TaskEnvelope {
            id: Uuid::new_v4(),
            kind: TaskKind::RefreshSource,
            kwargs,
            lane: Lane::Default,
            status: TaskStatus::Running,
            eta: Utc::now(),
            attempts: 2,
            max_retries: 3,
            dedup_key: None,
            result: None,
            last_error: None,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            finished_at: None,
        }
    }

    #[derive(Deserialize)]
    struct Args {
        source_id: Uuid,
    }

    #[test]
    fn test_task_context_kwargs() {
        let source_id = Uuid::new_v4();
        let ctx = TaskContext::new(envelope(json!({ "source_id": source_id })));
        let args: Args = ctx.kwargs().unwrap();
        assert_eq!(args.source_id, source_id);
    }

    #[test]
    fn test_task_context_malformed_kwargs() {
        let ctx = TaskContext::new(envelope(json!({ "source_id": 7 })));
        let err = ctx.kwargs::<Args>().err().unwrap();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_holder_id_includes_attempt() {
        let task = envelope(json!({}));
        assert_eq!(holder_id(&task), format!("{}#2", task.id));
        let mut redelivered = task.clone();
        redelivered.attempts += 1;
        assert_ne!(holder_id(&task), holder_id(&redelivered));
    }

    #[test]
    fn test_from_error_classification() {
        let transient = Error::Fetch(FetchError::Transport("reset".into()));
        assert!(matches!(
            TaskResult::from_error(&transient),
            TaskResult::Retry(_)
        ));

        let fatal = Error::InvalidInput("bad".into());
        assert!(matches!(TaskResult::from_error(&fatal), TaskResult::Failed(_)));
    }

    #[tokio::test]
    async fn test_noop_handler() {
        let handler = NoOpHandler::new(TaskKind::ProcessRag);
        assert_eq!(handler.kind(), TaskKind::ProcessRag);
        assert!(handler.can_handle(TaskKind::ProcessRag));
        assert!(!handler.can_handle(TaskKind::ProcessImages));

        let result = handler.execute(TaskContext::new(envelope(json!({})))).await;
        assert_eq!(result, TaskResult::Success(None));

        let timeout = handler.on_timeout(&envelope(json!({}))).await;
        assert!(matches!(timeout, TaskResult::Retry(_)));
    }
}
