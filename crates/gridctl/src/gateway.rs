use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::stack::{AgentSpec, ToolSelector};
use crate::error::{GatewayError, Result};
use crate::router::Router;
use crate::rpc::{
    Capabilities, GetPromptResult, InitializeResult, ListChanged, Prompt, PromptContent, PromptMessage, ServerInfo,
    MCP_PROTOCOL_VERSION,
};
use crate::session::SessionManager;
use crate::tool::{CallResult, Tool};

pub const GRIDCTL_SERVER_NAME: &str = "gridctl";

/// Lifecycle state of a registry skill, mirrored here only for the MCP
/// `prompts/*` projection spec.md §4.4 asks for — full skill browsing is
/// out of scope (spec.md §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillState {
    Draft,
    Active,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: Option<String>,
    pub body: String,
    pub state: SkillState,
}

/// Header carrying caller identity; the `MCP_ENDPOINT` the gateway injects
/// into agent workloads plus this header is how an agent's calls are
/// attributed (spec.md §4.4).
pub const AGENT_HEADER: &str = "X-Gridctl-Agent";

/// Owns sessions, the router, and the agent-access table; implements the
/// MCP methods listed in spec.md §4.4. Transport-agnostic: the axum server
/// in `gridctl-gateway` calls these methods from `/mcp`, `/sse`/`/message`,
/// and anywhere else a JSON-RPC request needs dispatching.
pub struct Gateway {
    pub router: Arc<Router>,
    pub sessions: Arc<SessionManager>,
    agents: tokio::sync::RwLock<HashMap<String, AgentSpec>>,
    skills: tokio::sync::RwLock<HashMap<String, Skill>>,
}

impl Gateway {
    pub fn new(router: Arc<Router>) -> Self {
        Gateway {
            router,
            sessions: Arc::new(SessionManager::new()),
            agents: tokio::sync::RwLock::new(HashMap::new()),
            skills: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_agent(&self, name: impl Into<String>, spec: AgentSpec) {
        self.agents.write().await.insert(name.into(), spec);
    }

    pub async fn unregister_agent(&self, name: &str) {
        self.agents.write().await.remove(name);
    }

    pub async fn agent_names(&self) -> Vec<String> {
        self.agents.read().await.keys().cloned().collect()
    }

    pub async fn set_skill(&self, skill: Skill) {
        self.skills.write().await.insert(skill.name.clone(), skill);
    }

    pub async fn remove_skill(&self, name: &str) {
        self.skills.write().await.remove(name);
    }

    /// `initialize` — spec.md §4.4: protocol version, server info, and
    /// capabilities. `prompts` is always advertised, even when the skills
    /// registry has no active entries (spec.md §9 open question).
    pub fn initialize(&self) -> InitializeResult {
        InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            server_info: ServerInfo {
                name: GRIDCTL_SERVER_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            capabilities: Capabilities {
                tools: ListChanged { list_changed: false },
                prompts: ListChanged { list_changed: false },
            },
        }
    }

    /// `ping` — spec.md §4.4.
    pub fn ping(&self) -> Value {
        serde_json::json!({ "status": "ok" })
    }

    /// Access-control predicate (spec.md §4.4): tool `P__T` is permitted for
    /// agent `a` iff some selector names server `P` and either lists no
    /// tools (full access) or explicitly lists `T`.
    fn permitted(uses: &[ToolSelector], server: &str, tool: &str) -> bool {
        uses.iter().any(|selector| {
            selector.server == server
                && selector.tools.as_ref().map(|tools| tools.iter().any(|t| t == tool)).unwrap_or(true)
        })
    }

    /// Splits a prefixed name into its server/tool halves for the access
    /// check; returns `None` if it doesn't look like a prefixed name (the
    /// router will reject it with `UnknownTool` regardless).
    fn split_for_access_check(prefixed_name: &str) -> Option<(&str, &str)> {
        crate::tool::split_prefixed(prefixed_name).ok()
    }

    /// `tools/list` — the agent-filtered projection of the aggregated
    /// catalog. An unknown caller gets the unfiltered catalog (spec.md
    /// §4.4: "if the caller is unknown, returns the unfiltered catalog").
    pub async fn tools_list(&self, caller: Option<&str>) -> Vec<Tool> {
        let catalog = self.router.aggregated_tools().await;
        let Some(caller) = caller else { return catalog };
        let agents = self.agents.read().await;
        let Some(agent) = agents.get(caller) else { return catalog };

        catalog
            .into_iter()
            .filter(|tool| match Self::split_for_access_check(&tool.name) {
                Some((server, name)) => Self::permitted(&agent.uses, server, name),
                None => false,
            })
            .collect()
    }

    /// `tools/call` — resolves the prefixed name, checks permission *before*
    /// contacting the downstream for known agents, then forwards unchanged.
    pub async fn tools_call(
        &self,
        ctx: CancellationToken,
        caller: Option<&str>,
        prefixed_name: &str,
        args: Value,
    ) -> Result<CallResult> {
        if let Some(caller) = caller {
            let agents = self.agents.read().await;
            if let Some(agent) = agents.get(caller) {
                let (server, tool) = Self::split_for_access_check(prefixed_name)
                    .ok_or_else(|| GatewayError::UnknownTool(prefixed_name.to_string()))?;
                if !Self::permitted(&agent.uses, server, tool) {
                    return Err(GatewayError::PermissionDenied(format!(
                        "agent '{caller}' is not permitted to call '{prefixed_name}'"
                    )));
                }
            }
        }
        self.router.call(ctx, prefixed_name, args).await
    }

    /// `prompts/list` — active skills projected as MCP prompts; draft and
    /// disabled skills are not exposed (spec.md §4.4).
    pub async fn prompts_list(&self) -> Vec<Prompt> {
        self.skills
            .read()
            .await
            .values()
            .filter(|s| s.state == SkillState::Active)
            .map(|s| Prompt { name: s.name.clone(), description: s.description.clone() })
            .collect()
    }

    /// `prompts/get` — the skill's body as the single message.
    pub async fn prompts_get(&self, name: &str) -> Result<GetPromptResult> {
        let skills = self.skills.read().await;
        let skill = skills
            .get(name)
            .filter(|s| s.state == SkillState::Active)
            .ok_or_else(|| GatewayError::UnknownTool(name.to_string()))?;
        Ok(GetPromptResult {
            description: skill.description.clone(),
            messages: vec![PromptMessage {
                role: "user".to_string(),
                content: PromptContent { kind: "text".to_string(), text: skill.body.clone() },
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downstream::DownstreamClient;
    use crate::router::Router;
    use async_trait::async_trait;

    struct FakeTransport {
        tools: Vec<Tool>,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl crate::downstream::Transport for FakeTransport {
        async fn initialize(&self, _ctx: CancellationToken) -> Result<ServerInfo> {
            Ok(ServerInfo { name: "math".into(), version: "0.0.0".into() })
        }
        async fn list_tools(&self, _ctx: CancellationToken) -> Result<Vec<Tool>> {
            Ok(self.tools.clone())
        }
        async fn call_tool(&self, _ctx: CancellationToken, name: &str, _args: Value) -> Result<CallResult> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(CallResult::text(format!("called {name}")))
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        async fn ping(&self, _ctx: CancellationToken) -> Result<()> {
            Ok(())
        }
    }

    fn tool(name: &str) -> Tool {
        Tool { name: name.to_string(), title: None, description: "d".to_string(), input_schema: serde_json::json!({}) }
    }

    async fn gateway_with_math() -> (Gateway, Arc<FakeTransport>) {
        let router = Arc::new(Router::new());
        let transport = Arc::new(FakeTransport {
            tools: vec![tool("add"), tool("echo")],
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let client = Arc::new(DownstreamClient::new("math", transport.clone(), None));
        client.initialize(CancellationToken::new()).await.unwrap();
        router.add_client(client).await.unwrap();
        (Gateway::new(router), transport)
    }

    #[tokio::test]
    async fn unknown_caller_sees_unfiltered_catalog() {
        let (gateway, _) = gateway_with_math().await;
        let tools = gateway.tools_list(Some("nobody")).await;
        assert_eq!(tools.len(), 2);
    }

    #[tokio::test]
    async fn restricted_agent_sees_only_permitted_tools() {
        let (gateway, _) = gateway_with_math().await;
        gateway
            .register_agent(
                "restricted",
                AgentSpec {
                    uses: vec![ToolSelector { server: "math".to_string(), tools: Some(vec!["add".to_string()]) }],
                    a2a: false,
                    description: None,
                },
            )
            .await;

        let tools = gateway.tools_list(Some("restricted")).await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "math__add");
    }

    #[tokio::test]
    async fn permission_denied_call_never_reaches_downstream() {
        let (gateway, transport) = gateway_with_math().await;
        gateway
            .register_agent(
                "restricted",
                AgentSpec {
                    uses: vec![ToolSelector { server: "math".to_string(), tools: Some(vec!["add".to_string()]) }],
                    a2a: false,
                    description: None,
                },
            )
            .await;

        let err = gateway
            .tools_call(CancellationToken::new(), Some("restricted"), "math__echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PermissionDenied(_)));
        assert_eq!(transport.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn permitted_call_forwards_to_downstream() {
        let (gateway, transport) = gateway_with_math().await;
        gateway
            .register_agent(
                "restricted",
                AgentSpec {
                    uses: vec![ToolSelector { server: "math".to_string(), tools: Some(vec!["add".to_string()]) }],
                    a2a: false,
                    description: None,
                },
            )
            .await;

        gateway
            .tools_call(CancellationToken::new(), Some("restricted"), "math__add", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(transport.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn prompts_list_excludes_draft_and_disabled() {
        let (gateway, _) = gateway_with_math().await;
        gateway
            .set_skill(Skill { name: "active".into(), description: None, body: "hi".into(), state: SkillState::Active })
            .await;
        gateway
            .set_skill(Skill { name: "draft".into(), description: None, body: "wip".into(), state: SkillState::Draft })
            .await;

        let prompts = gateway.prompts_list().await;
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].name, "active");
    }
}
