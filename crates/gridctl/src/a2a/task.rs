use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{GatewayError, Result};

/// Default bound on the per-agent in-memory task store (spec.md §4.6).
pub const DEFAULT_TASK_STORE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Submitted,
    Working,
    InputRequired,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub parts: Vec<Message>,
}

/// A2A unit of work with a finite-state lifecycle (spec.md §3/§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    pub status: TaskStatus,
    pub history: Vec<Message>,
    pub artifacts: Vec<Artifact>,
    pub last_update: DateTime<Utc>,
}

impl Task {
    pub fn new(id: String, context_id: Option<String>, initial_message: Message) -> Self {
        Task {
            id,
            context_id,
            status: TaskStatus::Submitted,
            history: vec![initial_message],
            artifacts: Vec::new(),
            last_update: Utc::now(),
        }
    }

    /// Applies the transition in spec.md §4.6's diagram:
    /// `submitted → working → (input-required ↔ working)* → completed|failed`,
    /// with `cancel` reachable from any non-terminal state. Status is
    /// monotonic except through an explicit cancel/fail.
    pub fn transition(&mut self, to: TaskStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(GatewayError::Conflict(format!("task '{}' is already terminal ({:?})", self.id, self.status)));
        }
        let allowed = match (self.status, to) {
            (TaskStatus::Submitted, TaskStatus::Working) => true,
            (TaskStatus::Working, TaskStatus::InputRequired) => true,
            (TaskStatus::InputRequired, TaskStatus::Working) => true,
            (TaskStatus::Working, TaskStatus::Completed) => true,
            (TaskStatus::Working, TaskStatus::Failed) => true,
            (TaskStatus::InputRequired, TaskStatus::Failed) => true,
            (_, TaskStatus::Canceled) => true,
            _ => false,
        };
        if !allowed {
            return Err(GatewayError::Conflict(format!("illegal transition {:?} -> {:?} for task '{}'", self.status, to, self.id)));
        }
        self.status = to;
        self.last_update = Utc::now();
        Ok(())
    }
}

fn unguessable_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Bounded, insertion-ordered task store. Eviction of the oldest entry is
/// refused while it is non-terminal (spec.md §4.6: "eviction is disallowed
/// for non-terminal tasks (error if bound reached)") — `lru`'s API doesn't
/// naturally express that refusal, so this rolls its own (DESIGN.md).
pub struct TaskStore {
    capacity: usize,
    tasks: RwLock<IndexMap<String, Task>>,
}

impl TaskStore {
    pub fn new(capacity: usize) -> Self {
        TaskStore { capacity, tasks: RwLock::new(IndexMap::new()) }
    }

    pub async fn create(&self, context_id: Option<String>, initial_message: Message) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        if tasks.len() >= self.capacity {
            let oldest_non_terminal = tasks.values().find(|t| !t.status.is_terminal()).is_some();
            let oldest_evictable = tasks
                .iter()
                .find(|(_, t)| t.status.is_terminal())
                .map(|(id, _)| id.clone());
            match oldest_evictable {
                Some(id) => {
                    tasks.shift_remove(&id);
                }
                None if oldest_non_terminal => {
                    return Err(GatewayError::Conflict("task store is full and every task is non-terminal".to_string()));
                }
                None => {}
            }
        }
        let task = Task::new(unguessable_task_id(), context_id, initial_message);
        tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.tasks.read().await.get(id).cloned()
    }

    pub async fn transition(&self, id: &str, to: TaskStatus) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(id).ok_or_else(|| GatewayError::UnknownTool(format!("task '{id}'")))?;
        task.transition(to)?;
        Ok(task.clone())
    }

    pub async fn append_history(&self, id: &str, message: Message) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(id).ok_or_else(|| GatewayError::UnknownTool(format!("task '{id}'")))?;
        task.history.push(message);
        Ok(())
    }

    pub async fn attach_artifact(&self, id: &str, artifact: Artifact) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(id).ok_or_else(|| GatewayError::UnknownTool(format!("task '{id}'")))?;
        task.artifacts.push(artifact);
        Ok(())
    }

    /// Transitions to `completed`, attaching `artifact` first — spec.md
    /// §4.6: "transitions to completed/failed attach at least one artifact
    /// or a terminal message."
    pub async fn complete(&self, id: &str, artifact: Artifact) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(id).ok_or_else(|| GatewayError::UnknownTool(format!("task '{id}'")))?;
        task.artifacts.push(artifact);
        task.transition(TaskStatus::Completed)?;
        Ok(task.clone())
    }

    /// Transitions to `failed`, appending `message` to history first.
    pub async fn fail(&self, id: &str, message: Message) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(id).ok_or_else(|| GatewayError::UnknownTool(format!("task '{id}'")))?;
        task.history.push(message);
        task.transition(TaskStatus::Failed)?;
        Ok(task.clone())
    }

    /// `tasks/cancel` — transitions `submitted|working|input-required →
    /// canceled`; terminal states are left untouched rather than erroring,
    /// matching spec.md §4.6's "terminal states are not affected".
    pub async fn cancel(&self, id: &str) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(id).ok_or_else(|| GatewayError::UnknownTool(format!("task '{id}'")))?;
        if !task.status.is_terminal() {
            task.transition(TaskStatus::Canceled)?;
        }
        Ok(task.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg() -> Message {
        Message { role: "user".to_string(), text: "hi".to_string() }
    }

    #[tokio::test]
    async fn new_task_starts_submitted() {
        let store = TaskStore::new(10);
        let task = store.create(None, msg()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Submitted);
        assert_eq!(task.history.len(), 1);
    }

    #[tokio::test]
    async fn follows_the_documented_state_diagram() {
        let store = TaskStore::new(10);
        let task = store.create(None, msg()).await.unwrap();
        store.transition(&task.id, TaskStatus::Working).await.unwrap();
        store.transition(&task.id, TaskStatus::InputRequired).await.unwrap();
        store.transition(&task.id, TaskStatus::Working).await.unwrap();
        let done = store.complete(&task.id, Artifact { name: "result".into(), parts: vec![msg()] }).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn cancel_is_reachable_from_any_nonterminal_state() {
        let store = TaskStore::new(10);
        let task = store.create(None, msg()).await.unwrap();
        let canceled = store.cancel(&task.id).await.unwrap();
        assert_eq!(canceled.status, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn cancel_on_terminal_task_is_a_noop() {
        let store = TaskStore::new(10);
        let task = store.create(None, msg()).await.unwrap();
        store.cancel(&task.id).await.unwrap();
        let still_canceled = store.cancel(&task.id).await.unwrap();
        assert_eq!(still_canceled.status, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let store = TaskStore::new(10);
        let task = store.create(None, msg()).await.unwrap();
        let err = store.transition(&task.id, TaskStatus::Completed).await.unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }

    #[tokio::test]
    async fn full_store_rejects_when_every_task_is_nonterminal() {
        let store = TaskStore::new(1);
        store.create(None, msg()).await.unwrap();
        let err = store.create(None, msg()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }

    #[tokio::test]
    async fn full_store_evicts_a_terminal_task_to_make_room() {
        let store = TaskStore::new(1);
        let first = store.create(None, msg()).await.unwrap();
        store.cancel(&first.id).await.unwrap();
        let second = store.create(None, msg()).await.unwrap();
        assert!(store.get(&first.id).await.is_none());
        assert!(store.get(&second.id).await.is_some());
    }
}
