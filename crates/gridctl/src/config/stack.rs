use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The YAML stack file, deserialized as-is. No schema validation beyond what
/// serde's own deserialization provides — schema validation proper is out of
/// scope (spec.md §1); this struct is the interface boundary the spec names.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stack {
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, McpServerSpec>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentSpec>,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceSpec>,
    #[serde(default)]
    pub network: NetworkSpec,
    /// Remote A2A agents an agent's `uses` selectors may name, registered
    /// with an endpoint and optional credential (spec.md §3). Bridged into
    /// the router as MCP tool adapters, not MCP servers proper.
    #[serde(default)]
    pub remotes: BTreeMap<String, crate::a2a::RemoteAgentSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpServerSpec {
    ContainerHttp {
        image: String,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        auth: Option<AuthSpec>,
        #[serde(default)]
        whitelist: Option<Vec<String>>,
    },
    ContainerSse {
        image: String,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        auth: Option<AuthSpec>,
        #[serde(default)]
        whitelist: Option<Vec<String>>,
    },
    ContainerStdio {
        image: String,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        whitelist: Option<Vec<String>>,
    },
    LocalProcess {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        whitelist: Option<Vec<String>>,
    },
    Ssh {
        host: String,
        user: String,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        identity_file: Option<String>,
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        whitelist: Option<Vec<String>>,
    },
    ExternalUrl {
        url: String,
        #[serde(default)]
        auth: Option<AuthSpec>,
        #[serde(default)]
        whitelist: Option<Vec<String>>,
    },
    Openapi {
        spec: String,
        base_url: String,
        #[serde(default)]
        auth: Option<AuthSpec>,
        #[serde(default)]
        include: Option<Vec<String>>,
        #[serde(default)]
        exclude: Option<Vec<String>>,
    },
}

impl McpServerSpec {
    pub fn whitelist(&self) -> Option<&Vec<String>> {
        match self {
            McpServerSpec::ContainerHttp { whitelist, .. }
            | McpServerSpec::ContainerSse { whitelist, .. }
            | McpServerSpec::ContainerStdio { whitelist, .. }
            | McpServerSpec::LocalProcess { whitelist, .. }
            | McpServerSpec::Ssh { whitelist, .. }
            | McpServerSpec::ExternalUrl { whitelist, .. } => whitelist.as_ref(),
            McpServerSpec::Openapi { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthSpec {
    Bearer { token_env: String },
    Header { name: String, value_env: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentSpec {
    #[serde(default)]
    pub uses: Vec<ToolSelector>,
    #[serde(default)]
    pub a2a: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ToolSelector {
    pub server: String,
    #[serde(default)]
    pub tools: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceSpec {
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkSpec {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub networks: Vec<String>,
}

impl Stack {
    pub fn parse_yaml(contents: &str) -> Result<Stack, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_local_process_server() {
        let yaml = r#"
mcp_servers:
  math:
    type: local_process
    command: "./math-server"
"#;
        let stack = Stack::parse_yaml(yaml).unwrap();
        let server = stack.mcp_servers.get("math").unwrap();
        assert!(matches!(server, McpServerSpec::LocalProcess { command, .. } if command == "./math-server"));
    }

    #[test]
    fn parses_agent_with_tool_selector() {
        let yaml = r#"
agents:
  restricted:
    uses:
      - server: math
        tools: [add]
"#;
        let stack = Stack::parse_yaml(yaml).unwrap();
        let agent = stack.agents.get("restricted").unwrap();
        assert_eq!(agent.uses[0].server, "math");
        assert_eq!(agent.uses[0].tools.as_deref(), Some(&["add".to_string()][..]));
    }
}
