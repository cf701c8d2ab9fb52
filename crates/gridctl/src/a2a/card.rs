use serde::{Deserialize, Serialize};

/// One per local A2A-enabled agent (spec.md §3). Served at
/// `/.well-known/agent.json` (the full directory) and `/a2a/{agent}` GET
/// (a single card).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCard {
    pub name: String,
    pub description: String,
    pub version: String,
    pub skills: Vec<AgentSkill>,
    pub capabilities: AgentCapabilities,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSkill {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Streaming and push notifications are unsupported (spec.md §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapabilities {
    pub streaming: bool,
    #[serde(rename = "pushNotifications")]
    pub push_notifications: bool,
}

impl Default for AgentCapabilities {
    fn default() -> Self {
        AgentCapabilities { streaming: false, push_notifications: false }
    }
}

/// Credential for reaching a *remote* A2A agent registered via an agent's
/// `uses` list — distinct from the bearer token gridctl's own northbound
/// surface accepts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteAuth {
    Bearer { token_env: String },
    ApiKey { header: String, value_env: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteAgentSpec {
    pub endpoint: String,
    #[serde(default)]
    pub auth: Option<RemoteAuth>,
}
