// Node contract shared by every executable unit in a workflow graph

pub mod builtin;
pub mod catalog;
pub mod registry;

pub use catalog::{NodeCategory, PluginCatalog, PluginSource};
pub use registry::{LoadReport, NodeHandle, NodePlugin, NodeRegistry, ResolvedNode, SkippedPlugin};

use crate::types::RunId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Static metadata for one node kind, in the normalized form the registry serves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    pub name: String,
    pub category: String,
    pub version: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<NodeParameter>,
    #[serde(default)]
    pub inputs: Vec<NodePort>,
    #[serde(default)]
    pub outputs: Vec<NodePort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, category: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            category: category.into(),
            version: 1,
            description: String::new(),
            parameters: Vec::new(),
            inputs: vec![NodePort::json("main")],
            outputs: vec![NodePort::json("main")],
            config_schema: None,
            input_schema: None,
            output_schema: None,
        }
    }

    pub fn with_parameter(mut self, parameter: NodeParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&NodeParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Apply parameter defaults to a node's static config.
    ///
    /// Returns the name of the first required parameter that is still missing.
    pub fn resolve_config(
        &self,
        config: &serde_json::Value,
    ) -> Result<serde_json::Map<String, serde_json::Value>, String> {
        let mut resolved = match config {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };

        for parameter in &self.parameters {
            if resolved.contains_key(&parameter.name) {
                continue;
            }
            match &parameter.default {
                Some(default) => {
                    resolved.insert(parameter.name.clone(), default.clone());
                }
                None if parameter.required => return Err(parameter.name.clone()),
                None => {}
            }
        }

        Ok(resolved)
    }
}

/// User-configurable field of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeParameter {
    pub name: String,
    pub kind: ParameterKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl NodeParameter {
    pub fn new(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            required: false,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    String,
    Number,
    Boolean,
    Json,
    Options,
}

/// Named, typed input or output port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePort {
    pub name: String,
    pub data_type: String,
}

impl NodePort {
    pub fn json(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: "json".to_string(),
        }
    }
}

/// Rich, versioned node description (the newer plugin shape)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    /// Canonical registry name
    pub name: String,
    pub display_name: String,
    /// Grouping tags; the first entry is used as the category
    pub group: Vec<String>,
    pub versions: Vec<u32>,
    pub default_version: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub properties: Vec<NodeProperty>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// Property of a versioned node description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeProperty {
    pub name: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub kind: ParameterKind,
    #[serde(default)]
    pub default: serde_json::Value,
    #[serde(default)]
    pub required: bool,
}

/// The node as placed in a workflow: `{id, data: {config}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: String,
    pub node_type: String,
    pub config: serde_json::Value,
}

impl NodeInstance {
    pub fn config_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.config.get(key)
    }
}

/// Per-invocation context; every node call receives its own value
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: RunId,
    pub node_id: String,
    /// Resolved config merged with predecessor outputs
    pub input: serde_json::Value,
    /// Full outputs of every node executed so far in this run
    pub node_outputs: Arc<HashMap<String, serde_json::Value>>,
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    /// Cancelled when the run is cancelled; long I/O should select on it
    pub cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new(run_id: RunId, node_id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
            input,
            node_outputs: Arc::new(HashMap::new()),
            user_id: None,
            agent_id: None,
            session_id: None,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn input_field(&self, key: &str) -> Option<&serde_json::Value> {
        self.input.get(key)
    }

    /// Output of any earlier node in the run, adjacent or not
    pub fn ancestor_output(&self, node_id: &str) -> Option<&serde_json::Value> {
        self.node_outputs.get(node_id)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Result of one node invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            duration_ms: 0,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            duration_ms: 0,
        }
    }
}

/// Legacy node shape: flat definition, returns an [`ExecutionResult`]
#[async_trait::async_trait]
pub trait Node: Send + Sync {
    /// Pure; called once at registration
    fn definition(&self) -> NodeDefinition;

    async fn execute(&self, node: &NodeInstance, ctx: &ExecutionContext) -> ExecutionResult;
}

/// Versioned node shape: rich description, returns the output value or an error
#[async_trait::async_trait]
pub trait VersionedNode: Send + Sync {
    fn description(&self) -> NodeDescription;

    async fn execute(
        &self,
        node: &NodeInstance,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<serde_json::Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_config_applies_defaults() {
        let definition = NodeDefinition::new("http", "action")
            .with_parameter(NodeParameter::new("method", ParameterKind::Options).with_default(json!("GET")))
            .with_parameter(NodeParameter::new("url", ParameterKind::String).required());

        let resolved = definition
            .resolve_config(&json!({"url": "https://example.com"}))
            .unwrap();
        assert_eq!(resolved["method"], json!("GET"));
        assert_eq!(resolved["url"], json!("https://example.com"));

        let missing = definition.resolve_config(&json!({})).unwrap_err();
        assert_eq!(missing, "url");
    }

    #[test]
    fn test_resolve_config_keeps_explicit_values() {
        let definition = NodeDefinition::new("http", "action")
            .with_parameter(NodeParameter::new("method", ParameterKind::Options).with_default(json!("GET")));

        let resolved = definition.resolve_config(&json!({"method": "POST"})).unwrap();
        assert_eq!(resolved["method"], json!("POST"));

        let resolved = definition.resolve_config(&serde_json::Value::Null).unwrap();
        assert_eq!(resolved["method"], json!("GET"));
    }

    #[test]
    fn test_context_ancestor_lookup() {
        let mut outputs = HashMap::new();
        outputs.insert("upload".to_string(), json!({"path": "/tmp/a.csv"}));

        let mut ctx = ExecutionContext::new(RunId::new("r1"), "parse", json!({"rows": 3}));
        ctx.node_outputs = Arc::new(outputs);

        assert_eq!(ctx.input_field("rows"), Some(&json!(3)));
        assert_eq!(ctx.ancestor_output("upload").unwrap()["path"], json!("/tmp/a.csv"));
        assert!(ctx.ancestor_output("missing").is_none());
        assert!(!ctx.is_cancelled());
    }
}
