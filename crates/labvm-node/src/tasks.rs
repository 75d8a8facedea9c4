use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::debug;

use crate::id;
use crate::store::now_ms;
use crate::vm::OperationResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A background operation submitted on behalf of a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub task_id: String,
    pub name: String,
    pub vm_id: String,
    pub status: TaskStatus,
    pub result: Option<OperationResult>,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
}

/// How long a finished task stays pollable.
pub const DEFAULT_TASK_RETENTION: Duration = Duration::from_secs(3600);

/// Tracks background tasks so callers can poll for their outcome.
///
/// Finished tasks are dropped once they are older than the retention window;
/// pending and running ones are never dropped.
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, TaskRecord>>,
    retention: Duration,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_TASK_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Record a new pending task and return its id. Expired tasks are
    /// pruned first.
    pub async fn submit(&self, name: &str, vm_id: &str) -> String {
        let task_id = id::generate_id(id::TASK_PREFIX);
        let mut tasks = self.tasks.write().await;
        let pruned = prune_finished(&mut tasks, self.retention, now_ms());
        if pruned > 0 {
            debug!(pruned, "dropped expired tasks");
        }
        tasks.insert(
            task_id.clone(),
            TaskRecord {
                task_id: task_id.clone(),
                name: name.to_string(),
                vm_id: vm_id.to_string(),
                status: TaskStatus::Pending,
                result: None,
                created_at_ms: now_ms(),
                completed_at_ms: None,
            },
        );
        task_id
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn mark_running(&self, task_id: &str) {
        if let Some(task) = self.tasks.write().await.get_mut(task_id) {
            task.status = TaskStatus::Running;
        }
    }

    /// Store the outcome; the task succeeds or fails with the operation.
    pub async fn complete(&self, task_id: &str, result: OperationResult) {
        if let Some(task) = self.tasks.write().await.get_mut(task_id) {
            task.status = if result.success {
                TaskStatus::Succeeded
            } else {
                TaskStatus::Failed
            };
            task.result = Some(result);
            task.completed_at_ms = Some(now_ms());
        }
    }

    pub async fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.tasks.read().await.get(task_id).cloned()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn prune_finished(tasks: &mut HashMap<String, TaskRecord>, retention: Duration, now: u64) -> usize {
    let retention_ms = u64::try_from(retention.as_millis()).unwrap_or(u64::MAX);
    let before = tasks.len();
    tasks.retain(|_, task| match task.completed_at_ms {
        Some(done) => now.saturating_sub(done) < retention_ms,
        None => true,
    });
    before - tasks.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn task_moves_through_states() {
        let tasks = TaskRegistry::new();
        let id = tasks.submit("create_vm", "vm_1").await;
        assert!(id.starts_with("task_"));

        let task = tasks.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.completed_at_ms.is_none());

        tasks.mark_running(&id).await;
        assert_eq!(tasks.get(&id).await.unwrap().status, TaskStatus::Running);

        tasks.complete(&id, OperationResult::ok("vm_1")).await;
        let task = tasks.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert!(task.completed_at_ms.is_some());
        assert_eq!(task.result, Some(OperationResult::ok("vm_1")));
    }

    #[tokio::test]
    async fn failed_operation_fails_task() {
        let tasks = TaskRegistry::new();
        let id = tasks.submit("create_vm", "vm_1").await;
        tasks
            .complete(&id, OperationResult::failed("vm_1", "disk copy failed"))
            .await;
        let task = tasks.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.result.unwrap().error.as_deref(),
            Some("disk copy failed")
        );
    }

    #[tokio::test]
    async fn expired_tasks_are_pruned_on_submit() {
        let tasks = TaskRegistry::with_retention(Duration::ZERO);
        let done = tasks.submit("create_vm", "vm_1").await;
        tasks.complete(&done, OperationResult::ok("vm_1")).await;
        let running = tasks.submit("create_vm", "vm_2").await;
        tasks.mark_running(&running).await;

        let pending = tasks.submit("create_vm", "vm_3").await;
        assert!(tasks.get(&done).await.is_none());
        assert_eq!(tasks.get(&running).await.unwrap().status, TaskStatus::Running);
        assert_eq!(tasks.get(&pending).await.unwrap().status, TaskStatus::Pending);
        assert_eq!(tasks.len().await, 2);
    }

    #[tokio::test]
    async fn finished_tasks_stay_within_retention() {
        let tasks = TaskRegistry::new();
        let id = tasks.submit("create_vm", "vm_1").await;
        tasks.complete(&id, OperationResult::ok("vm_1")).await;

        tasks.submit("create_vm", "vm_2").await;
        assert_eq!(tasks.get(&id).await.unwrap().status, TaskStatus::Succeeded);
        assert_eq!(tasks.len().await, 2);
    }

    #[test]
    fn prune_only_drops_old_finished_tasks() {
        let record = |id: &str, completed_at_ms: Option<u64>| TaskRecord {
            task_id: id.to_string(),
            name: "create_vm".to_string(),
            vm_id: "vm_1".to_string(),
            status: if completed_at_ms.is_some() {
                TaskStatus::Succeeded
            } else {
                TaskStatus::Running
            },
            result: None,
            created_at_ms: 0,
            completed_at_ms,
        };
        let mut tasks: HashMap<String, TaskRecord> = [
            ("old", Some(1_000)),
            ("fresh", Some(9_500)),
            ("busy", None),
        ]
        .into_iter()
        .map(|(id, done)| (id.to_string(), record(id, done)))
        .collect();

        let pruned = prune_finished(&mut tasks, Duration::from_secs(1), 10_000);
        assert_eq!(pruned, 1);
        assert!(!tasks.contains_key("old"));
        assert!(tasks.contains_key("fresh"));
        assert!(tasks.contains_key("busy"));
    }

    #[tokio::test]
    async fn unknown_task_is_none() {
        let tasks = TaskRegistry::new();
        tasks.mark_running("task_missing").await;
        assert!(tasks.get("task_missing").await.is_none());
    }
}
