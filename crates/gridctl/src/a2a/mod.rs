mod adapter;
mod card;
mod task;

pub use adapter::RemoteAgentAdapter;
pub use card::{AgentCapabilities, AgentCard, AgentSkill, RemoteAgentSpec, RemoteAuth};
pub use task::{Artifact, Message, Task, TaskStatus, TaskStore, DEFAULT_TASK_STORE_CAPACITY};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;

/// Serves `/.well-known/agent.json` and per-agent JSON-RPC endpoints,
/// owning one `TaskStore` per local A2A-enabled agent (spec.md §4.6).
/// Construction order matters for the cyclic agent-uses-agent case
/// (spec.md §9): gateway created → A2A registered → local agents added →
/// A2A adapters registered last → `RefreshTools`. `A2aSubsystem` only holds
/// a reference to the `Gateway`, never the other way around.
pub struct A2aSubsystem {
    gateway: Arc<Gateway>,
    base_url: String,
    stores: RwLock<HashMap<String, Arc<TaskStore>>>,
}

impl A2aSubsystem {
    pub fn new(gateway: Arc<Gateway>, base_url: String) -> Self {
        A2aSubsystem { gateway, base_url, stores: RwLock::new(HashMap::new()) }
    }

    pub async fn register_local_agent(&self, name: &str) {
        self.stores
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TaskStore::new(DEFAULT_TASK_STORE_CAPACITY)));
    }

    pub async fn unregister_local_agent(&self, name: &str) {
        self.stores.write().await.remove(name);
    }

    pub async fn local_agent_names(&self) -> Vec<String> {
        self.stores.read().await.keys().cloned().collect()
    }

    async fn store_for(&self, agent: &str) -> Result<Arc<TaskStore>> {
        self.stores
            .read()
            .await
            .get(agent)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownServer(agent.to_string()))
    }

    /// Builds the agent's card from its own permitted tool catalog — each
    /// tool the agent can call is presented as an A2A skill, since skill
    /// authoring proper lives in the (out-of-scope) registry and this
    /// subsystem's only normative input is spec.md §3's AgentCard shape.
    pub async fn agent_card(&self, name: &str, description: &str) -> Result<AgentCard> {
        self.store_for(name).await?;
        let tools = self.gateway.tools_list(Some(name)).await;
        Ok(AgentCard {
            name: name.to_string(),
            description: description.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            skills: tools
                .into_iter()
                .map(|tool| AgentSkill {
                    id: tool.name.clone(),
                    name: tool.name,
                    description: tool.description,
                    tags: Vec::new(),
                })
                .collect(),
            capabilities: AgentCapabilities::default(),
            url: format!("{}/a2a/{name}", self.base_url.trim_end_matches('/')),
        })
    }

    pub async fn directory(&self, descriptions: &HashMap<String, String>) -> Vec<AgentCard> {
        let names = self.local_agent_names().await;
        let mut cards = Vec::with_capacity(names.len());
        for name in names {
            let description = descriptions.get(&name).cloned().unwrap_or_default();
            if let Ok(card) = self.agent_card(&name, &description).await {
                cards.push(card);
            }
        }
        cards
    }

    /// `message/send` — creates the task in `submitted`, appends the
    /// message to history, returns that snapshot, then advances the
    /// stored task to `working` (spec.md §4.6).
    pub async fn message_send(&self, agent: &str, context_id: Option<String>, message: Message) -> Result<Task> {
        let store = self.store_for(agent).await?;
        let task = store.create(context_id, message).await?;
        let snapshot = task.clone();
        store.transition(&task.id, TaskStatus::Working).await?;
        Ok(snapshot)
    }

    /// `tasks/get`.
    pub async fn tasks_get(&self, agent: &str, task_id: &str) -> Result<Task> {
        let store = self.store_for(agent).await?;
        store.get(task_id).await.ok_or_else(|| GatewayError::UnknownTool(format!("task '{task_id}'")))
    }

    /// `tasks/cancel`.
    pub async fn tasks_cancel(&self, agent: &str, task_id: &str) -> Result<Task> {
        let store = self.store_for(agent).await?;
        store.cancel(task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Router;

    #[tokio::test]
    async fn message_send_returns_submitted_snapshot_then_advances_to_working() {
        let gateway = Arc::new(Gateway::new(Arc::new(Router::new())));
        let a2a = A2aSubsystem::new(gateway, "http://localhost:8787".to_string());
        a2a.register_local_agent("writer").await;

        let snapshot = a2a
            .message_send("writer", None, Message { role: "user".to_string(), text: "draft a poem".to_string() })
            .await
            .unwrap();
        assert_eq!(snapshot.status, TaskStatus::Submitted);

        let current = a2a.tasks_get("writer", &snapshot.id).await.unwrap();
        assert_eq!(current.status, TaskStatus::Working);
    }

    #[tokio::test]
    async fn unknown_agent_is_unknown_server() {
        let gateway = Arc::new(Gateway::new(Arc::new(Router::new())));
        let a2a = A2aSubsystem::new(gateway, "http://localhost:8787".to_string());
        let err = a2a.tasks_get("ghost", "whatever").await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownServer(_)));
    }

    #[tokio::test]
    async fn cancel_transitions_submitted_task_to_canceled() {
        let gateway = Arc::new(Gateway::new(Arc::new(Router::new())));
        let a2a = A2aSubsystem::new(gateway, "http://localhost:8787".to_string());
        a2a.register_local_agent("writer").await;
        let task = a2a
            .message_send("writer", None, Message { role: "user".to_string(), text: "hi".to_string() })
            .await
            .unwrap();
        let canceled = a2a.tasks_cancel("writer", &task.id).await.unwrap();
        assert_eq!(canceled.status, TaskStatus::Canceled);
    }
}
