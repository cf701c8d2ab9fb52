pub mod diff;
pub mod expand;
pub mod paths;
pub mod stack;

pub use diff::ConfigDiff;
pub use paths::Paths;
pub use stack::{AgentSpec, AuthSpec, McpServerSpec, NetworkSpec, ResourceSpec, Stack, ToolSelector};
