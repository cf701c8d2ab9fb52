use std::collections::BTreeSet;

use super::stack::{NetworkSpec, Stack};

/// Field-wise diff between two stack generations. Maps and selector lists compare
/// as sets, per spec.md §3/§4.7 — insertion order in the YAML never affects equality.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub servers: EntityDiff,
    pub agents: EntityDiff,
    pub resources: EntityDiff,
    pub network_changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl EntityDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

impl ConfigDiff {
    pub fn is_noop(&self) -> bool {
        self.servers.is_empty()
            && self.agents.is_empty()
            && self.resources.is_empty()
            && !self.network_changed
    }

    pub fn compute(old: &Stack, new: &Stack) -> ConfigDiff {
        ConfigDiff {
            servers: diff_map(&old.mcp_servers, &new.mcp_servers),
            agents: diff_map(&old.agents, &new.agents),
            resources: diff_map(&old.resources, &new.resources),
            network_changed: networks_differ(&old.network, &new.network),
        }
    }
}

fn diff_map<V: PartialEq>(
    old: &std::collections::BTreeMap<String, V>,
    new: &std::collections::BTreeMap<String, V>,
) -> EntityDiff {
    let old_keys: BTreeSet<&String> = old.keys().collect();
    let new_keys: BTreeSet<&String> = new.keys().collect();

    let added = new_keys.difference(&old_keys).map(|s| s.to_string()).collect();
    let removed = old_keys.difference(&new_keys).map(|s| s.to_string()).collect();
    let modified = old_keys
        .intersection(&new_keys)
        .filter(|k| old.get(**k) != new.get(**k))
        .map(|s| s.to_string())
        .collect();

    EntityDiff { added, removed, modified }
}

fn networks_differ(old: &NetworkSpec, new: &NetworkSpec) -> bool {
    if old.mode != new.mode {
        return true;
    }
    let old_set: BTreeSet<&String> = old.networks.iter().collect();
    let new_set: BTreeSet<&String> = new.networks.iter().collect();
    old_set != new_set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_stack_is_noop() {
        let yaml = r#"
mcp_servers:
  math:
    type: local_process
    command: "./math-server"
"#;
        let a = Stack::parse_yaml(yaml).unwrap();
        let b = Stack::parse_yaml(yaml).unwrap();
        let diff = ConfigDiff::compute(&a, &b);
        assert!(diff.is_noop());
    }

    #[test]
    fn adding_a_server_is_reflected_in_added() {
        let old = Stack::parse_yaml(
            r#"
mcp_servers:
  a:
    type: local_process
    command: "./a"
"#,
        )
        .unwrap();
        let new = Stack::parse_yaml(
            r#"
mcp_servers:
  a:
    type: local_process
    command: "./a"
  b:
    type: local_process
    command: "./b"
"#,
        )
        .unwrap();
        let diff = ConfigDiff::compute(&old, &new);
        assert_eq!(diff.servers.added, vec!["b".to_string()]);
        assert!(diff.servers.removed.is_empty());
        assert!(diff.servers.modified.is_empty());
    }

    #[test]
    fn env_map_reorder_is_not_a_modification() {
        let old = Stack::parse_yaml(
            r#"
mcp_servers:
  a:
    type: local_process
    command: "./a"
    env:
      FOO: "1"
      BAR: "2"
"#,
        )
        .unwrap();
        let new = Stack::parse_yaml(
            r#"
mcp_servers:
  a:
    type: local_process
    command: "./a"
    env:
      BAR: "2"
      FOO: "1"
"#,
        )
        .unwrap();
        let diff = ConfigDiff::compute(&old, &new);
        assert!(diff.servers.is_empty());
    }
}
