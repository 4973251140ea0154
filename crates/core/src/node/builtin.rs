// Built-in nodes shipped with the runtime

use super::catalog::{NodeCategory, PluginCatalog};
use super::registry::NodePlugin;
use super::{
    ExecutionContext, ExecutionResult, Node, NodeDefinition, NodeDescription, NodeInstance,
    NodeParameter, NodeProperty, ParameterKind, VersionedNode,
};
use anyhow::anyhow;
use serde_json::{json, Value};
use std::time::Duration;

/// Catalog of every built-in plugin plus the deprecated ids they replace
pub fn catalog() -> PluginCatalog {
    let mut catalog = PluginCatalog::new();
    catalog
        .add(NodeCategory::Trigger, "manual-trigger", || {
            Ok(NodePlugin::versioned(ManualTrigger))
        })
        .add(NodeCategory::Trigger, "webhook-trigger", || {
            Ok(NodePlugin::versioned(WebhookTrigger))
        })
        .add(NodeCategory::Transform, "set", || Ok(NodePlugin::legacy(SetNode)))
        .add(NodeCategory::Flow, "no-op", || Ok(NodePlugin::legacy(NoOpNode)))
        .add(NodeCategory::Flow, "delay", || Ok(NodePlugin::versioned(DelayNode)))
        .alias("noOp", "no-op")
        .alias("wait", "delay");
    catalog
}

/// Copy of the input object without the node's own parameter keys
fn data_without(input: &Value, keys: &[&str]) -> serde_json::Map<String, Value> {
    let mut data = input.as_object().cloned().unwrap_or_default();
    for key in keys {
        data.remove(*key);
    }
    data
}

fn trigger_description(name: &str, display_name: &str, description: &str) -> NodeDescription {
    NodeDescription {
        name: name.to_string(),
        display_name: display_name.to_string(),
        group: vec![NodeCategory::Trigger.as_str().to_string()],
        versions: vec![1],
        default_version: 1,
        description: description.to_string(),
        properties: Vec::new(),
        inputs: Vec::new(),
        outputs: vec!["main".to_string()],
    }
}

/// Entry point for runs started by hand; emits the run input
pub struct ManualTrigger;

#[async_trait::async_trait]
impl VersionedNode for ManualTrigger {
    fn description(&self) -> NodeDescription {
        trigger_description(
            "manual-trigger",
            "Manual Trigger",
            "Starts the workflow with the input supplied by the caller",
        )
    }

    async fn execute(&self, _node: &NodeInstance, ctx: &ExecutionContext) -> anyhow::Result<Value> {
        Ok(ctx.input.clone())
    }
}

/// Entry point for webhook deliveries; emits the delivered payload
pub struct WebhookTrigger;

#[async_trait::async_trait]
impl VersionedNode for WebhookTrigger {
    fn description(&self) -> NodeDescription {
        let mut description = trigger_description(
            "webhook-trigger",
            "Webhook",
            "Starts the workflow when a webhook delivery is processed",
        );
        description.properties.push(NodeProperty {
            name: "path".to_string(),
            display_name: "Path".to_string(),
            kind: ParameterKind::String,
            default: Value::Null,
            required: false,
        });
        description
    }

    async fn execute(&self, _node: &NodeInstance, ctx: &ExecutionContext) -> anyhow::Result<Value> {
        Ok(Value::Object(data_without(&ctx.input, &["path"])))
    }
}

/// Merges static `values` over the incoming data
pub struct SetNode;

#[async_trait::async_trait]
impl Node for SetNode {
    fn definition(&self) -> NodeDefinition {
        let mut definition = NodeDefinition::new("set", NodeCategory::Transform.as_str())
            .with_parameter(NodeParameter::new("values", ParameterKind::Json).with_default(json!({})))
            .with_parameter(
                NodeParameter::new("keep_input", ParameterKind::Boolean).with_default(json!(true)),
            );
        definition.name = "Set".to_string();
        definition.description = "Sets fields on the item passing through".to_string();
        definition
    }

    async fn execute(&self, node: &NodeInstance, ctx: &ExecutionContext) -> ExecutionResult {
        let values = match node.config_value("values") {
            Some(Value::Object(values)) => values.clone(),
            Some(Value::Null) | None => Default::default(),
            Some(other) => {
                return ExecutionResult::failure(format!("values must be an object, got {}", other))
            }
        };

        let keep_input = node
            .config_value("keep_input")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let mut output = if keep_input {
            data_without(&ctx.input, &["values", "keep_input"])
        } else {
            Default::default()
        };
        output.extend(values);

        ExecutionResult::success(Value::Object(output))
    }
}

/// Passes its input through unchanged
pub struct NoOpNode;

#[async_trait::async_trait]
impl Node for NoOpNode {
    fn definition(&self) -> NodeDefinition {
        let mut definition = NodeDefinition::new("no-op", NodeCategory::Flow.as_str());
        definition.name = "No Operation".to_string();
        definition
    }

    async fn execute(&self, _node: &NodeInstance, ctx: &ExecutionContext) -> ExecutionResult {
        ExecutionResult::success(ctx.input.clone())
    }
}

/// Waits `ms` milliseconds, stopping early when the run is cancelled
pub struct DelayNode;

#[async_trait::async_trait]
impl VersionedNode for DelayNode {
    fn description(&self) -> NodeDescription {
        NodeDescription {
            name: "delay".to_string(),
            display_name: "Delay".to_string(),
            group: vec![NodeCategory::Flow.as_str().to_string()],
            versions: vec![1],
            default_version: 1,
            description: "Pauses the run before passing data on".to_string(),
            properties: vec![NodeProperty {
                name: "ms".to_string(),
                display_name: "Milliseconds".to_string(),
                kind: ParameterKind::Number,
                default: json!(1000),
                required: false,
            }],
            inputs: vec!["main".to_string()],
            outputs: vec!["main".to_string()],
        }
    }

    async fn execute(&self, node: &NodeInstance, ctx: &ExecutionContext) -> anyhow::Result<Value> {
        let ms = node
            .config_value("ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("ms must be a non-negative integer"))?;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
            _ = ctx.cancellation.cancelled() => return Err(anyhow!("delay interrupted by cancellation")),
        }

        Ok(Value::Object(data_without(&ctx.input, &["ms"])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeRegistry;
    use crate::types::RunId;

    fn instance(node_type: &str, config: Value) -> NodeInstance {
        NodeInstance {
            id: "n1".to_string(),
            node_type: node_type.to_string(),
            config,
        }
    }

    #[test]
    fn test_catalog_loads_cleanly() {
        let registry = NodeRegistry::new();
        let report = registry.load_catalog(&catalog());

        assert!(report.skipped.is_empty());
        assert_eq!(
            report.loaded,
            vec!["manual-trigger", "webhook-trigger", "set", "no-op", "delay"]
        );
        assert_eq!(registry.resolve("noOp").unwrap().definition.id, "no-op");
        assert_eq!(registry.resolve("wait").unwrap().definition.id, "delay");
    }

    #[tokio::test]
    async fn test_set_merges_values() {
        let ctx = ExecutionContext::new(
            RunId::new("r1"),
            "n1",
            json!({"a": 1, "b": 2, "values": {"b": 3}}),
        );
        let result = SetNode
            .execute(&instance("set", json!({"values": {"b": 3}, "keep_input": true})), &ctx)
            .await;
        assert_eq!(result.output, Some(json!({"a": 1, "b": 3})));

        let result = SetNode
            .execute(&instance("set", json!({"values": {"c": 4}, "keep_input": false})), &ctx)
            .await;
        assert_eq!(result.output, Some(json!({"c": 4})));
    }

    #[tokio::test]
    async fn test_set_rejects_non_object_values() {
        let ctx = ExecutionContext::new(RunId::new("r1"), "n1", json!({}));
        let result = SetNode.execute(&instance("set", json!({"values": 5})), &ctx).await;
        assert!(!result.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_waits_then_passes_through() {
        let ctx = ExecutionContext::new(RunId::new("r1"), "n1", json!({"x": 1, "ms": 500}));
        let output = DelayNode
            .execute(&instance("delay", json!({"ms": 500})), &ctx)
            .await
            .unwrap();
        assert_eq!(output, json!({"x": 1}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_honours_cancellation() {
        let ctx = ExecutionContext::new(RunId::new("r1"), "n1", json!({}));
        let token = ctx.cancellation.clone();

        let handle = tokio::spawn(async move {
            DelayNode
                .execute(&instance("delay", json!({"ms": 60_000})), &ctx)
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("cancellation"));
    }
}
