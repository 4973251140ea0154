use super::catalog::{NodeCategory, PluginCatalog};
use super::{
    ExecutionContext, ExecutionResult, Node, NodeDefinition, NodeDescription, NodeInstance,
    NodeParameter, NodePort, VersionedNode,
};
use crate::error::RegistryError;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// A node implementation tagged with the definition shape it exposes
#[derive(Clone)]
pub enum NodePlugin {
    Legacy(Arc<dyn Node>),
    Versioned(Arc<dyn VersionedNode>),
}

impl NodePlugin {
    pub fn legacy(node: impl Node + 'static) -> Self {
        Self::Legacy(Arc::new(node))
    }

    pub fn versioned(node: impl VersionedNode + 'static) -> Self {
        Self::Versioned(Arc::new(node))
    }
}

impl std::fmt::Debug for NodePlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Legacy(_) => f.write_str("NodePlugin::Legacy"),
            Self::Versioned(_) => f.write_str("NodePlugin::Versioned"),
        }
    }
}

/// Normalize either plugin shape to the common [`NodeDefinition`]
pub fn normalize(plugin: &NodePlugin) -> NodeDefinition {
    match plugin {
        NodePlugin::Legacy(node) => node.definition(),
        NodePlugin::Versioned(node) => from_description(node.description()),
    }
}

fn from_description(description: NodeDescription) -> NodeDefinition {
    NodeDefinition {
        id: description.name,
        name: description.display_name,
        category: description.group.first().cloned().unwrap_or_default(),
        version: description.default_version,
        description: description.description,
        parameters: description
            .properties
            .into_iter()
            .map(|p| NodeParameter {
                name: p.name,
                kind: p.kind,
                default: (!p.default.is_null()).then_some(p.default),
                required: p.required,
                description: Some(p.display_name),
            })
            .collect(),
        inputs: description.inputs.iter().map(NodePort::json).collect(),
        outputs: description.outputs.iter().map(NodePort::json).collect(),
        config_schema: None,
        input_schema: None,
        output_schema: None,
    }
}

fn validate(definition: &NodeDefinition) -> Result<(), RegistryError> {
    let invalid = |reason: &str| RegistryError::InvalidDefinition {
        id: definition.id.clone(),
        reason: reason.to_string(),
    };

    if definition.id.trim().is_empty() {
        return Err(invalid("missing id"));
    }
    if definition.category.trim().is_empty() {
        return Err(invalid("missing category"));
    }

    let mut seen = HashSet::new();
    for parameter in &definition.parameters {
        if !seen.insert(parameter.name.as_str()) {
            return Err(invalid(&format!("duplicate parameter '{}'", parameter.name)));
        }
    }

    Ok(())
}

/// Executable handle normalizing both shapes to [`ExecutionResult`]
#[derive(Clone, Debug)]
pub struct NodeHandle {
    plugin: NodePlugin,
}

impl NodeHandle {
    /// Invoke the node. Errors and panics become `success: false`.
    pub async fn execute(&self, node: &NodeInstance, ctx: &ExecutionContext) -> ExecutionResult {
        let started = Instant::now();

        let outcome = match &self.plugin {
            NodePlugin::Legacy(plugin) => AssertUnwindSafe(plugin.execute(node, ctx))
                .catch_unwind()
                .await,
            NodePlugin::Versioned(plugin) => AssertUnwindSafe(async {
                match plugin.execute(node, ctx).await {
                    Ok(output) => ExecutionResult::success(output),
                    Err(e) => ExecutionResult::failure(format!("{:#}", e)),
                }
            })
            .catch_unwind()
            .await,
        };

        let mut result = outcome.unwrap_or_else(|panic| {
            ExecutionResult::failure(format!("node panicked: {}", panic_message(panic.as_ref())))
        });

        if result.duration_ms == 0 {
            result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        }
        if !result.success && result.error.is_none() {
            result.error = Some("node reported failure without an error message".to_string());
        }

        result
    }

    pub fn is_versioned(&self) -> bool {
        matches!(self.plugin, NodePlugin::Versioned(_))
    }

    /// Whether two handles invoke the same implementation instance
    pub fn same_implementation(&self, other: &NodeHandle) -> bool {
        match (&self.plugin, &other.plugin) {
            (NodePlugin::Legacy(a), NodePlugin::Legacy(b)) => Arc::ptr_eq(a, b),
            (NodePlugin::Versioned(a), NodePlugin::Versioned(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Definition plus executable handle, as returned by [`NodeRegistry::resolve`]
#[derive(Clone, Debug)]
pub struct ResolvedNode {
    pub definition: Arc<NodeDefinition>,
    pub handle: NodeHandle,
}

struct RegistryEntry {
    definition: Arc<NodeDefinition>,
    plugin: NodePlugin,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<String, RegistryEntry>,
    aliases: HashMap<String, String>,
}

/// A plugin the catalog could not load
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedPlugin {
    pub name: String,
    pub category: NodeCategory,
    pub reason: String,
}

/// Summary of a catalog load
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub skipped: Vec<SkippedPlugin>,
}

/// Registry mapping node ids to executable implementations.
///
/// Reads take a shared lock and may run concurrently from many workers;
/// registration and aliasing are serialized.
#[derive(Default)]
pub struct NodeRegistry {
    inner: RwLock<RegistryInner>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a plugin under its canonical id.
    ///
    /// Registering an id that already exists replaces the earlier entry.
    pub fn register(&self, plugin: NodePlugin) -> Result<String, RegistryError> {
        let definition = normalize(&plugin);
        validate(&definition)?;

        let id = definition.id.clone();
        let entry = RegistryEntry {
            definition: Arc::new(definition),
            plugin,
        };

        if self.write().entries.insert(id.clone(), entry).is_some() {
            tracing::warn!("Node {} registered twice, last registration wins", id);
        } else {
            tracing::debug!("Registered node {}", id);
        }

        Ok(id)
    }

    /// Map a deprecated or alternate id onto a canonical one
    pub fn alias(&self, from: impl Into<String>, to: impl Into<String>) {
        let (from, to) = (from.into(), to.into());
        tracing::debug!("Aliasing node {} -> {}", from, to);
        self.write().aliases.insert(from, to);
    }

    /// Remove a node; returns whether it was present
    pub fn unregister(&self, id: &str) -> bool {
        self.write().entries.remove(id).is_some()
    }

    /// Resolve an id (after alias substitution) to its definition and handle
    pub fn resolve(&self, id: &str) -> Result<ResolvedNode, RegistryError> {
        let inner = self.read();
        let canonical = inner.aliases.get(id).map(String::as_str).unwrap_or(id);

        inner
            .entries
            .get(canonical)
            .map(|entry| ResolvedNode {
                definition: entry.definition.clone(),
                handle: NodeHandle {
                    plugin: entry.plugin.clone(),
                },
            })
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resolve(id).is_ok()
    }

    /// All normalized definitions, sorted by id
    pub fn definitions(&self) -> Vec<Arc<NodeDefinition>> {
        let mut definitions: Vec<_> = self
            .read()
            .entries
            .values()
            .map(|e| e.definition.clone())
            .collect();
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        definitions
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Load every plugin in the catalog, category by category.
    ///
    /// A plugin that fails to load or exposes an invalid definition is
    /// skipped with a warning; loading never aborts.
    pub fn load_catalog(&self, catalog: &PluginCatalog) -> LoadReport {
        let mut report = LoadReport::default();

        for category in NodeCategory::ALL {
            for source in catalog.sources_in(category) {
                let loaded = (source.loader)()
                    .map_err(|e| RegistryError::LoadFailed {
                        name: source.name.clone(),
                        reason: format!("{:#}", e),
                    })
                    .and_then(|plugin| self.register(plugin));

                match loaded {
                    Ok(id) => report.loaded.push(id),
                    Err(e) => {
                        tracing::warn!("Skipping {} node plugin {}: {}", category, source.name, e);
                        report.skipped.push(SkippedPlugin {
                            name: source.name.clone(),
                            category,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        for (from, to) in catalog.aliases() {
            self.alias(from.clone(), to.clone());
        }

        tracing::info!(
            "Loaded {} node plugins ({} skipped)",
            report.loaded.len(),
            report.skipped.len()
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeProperty, ParameterKind};
    use crate::types::RunId;
    use serde_json::json;

    struct Echo {
        id: &'static str,
        tag: &'static str,
    }

    #[async_trait::async_trait]
    impl Node for Echo {
        fn definition(&self) -> NodeDefinition {
            NodeDefinition::new(self.id, "transform")
        }

        async fn execute(&self, _node: &NodeInstance, _ctx: &ExecutionContext) -> ExecutionResult {
            ExecutionResult::success(json!({ "tag": self.tag }))
        }
    }

    struct Upper;

    #[async_trait::async_trait]
    impl VersionedNode for Upper {
        fn description(&self) -> NodeDescription {
            NodeDescription {
                name: "upper".to_string(),
                display_name: "Uppercase".to_string(),
                group: vec!["transform".to_string()],
                versions: vec![1, 2],
                default_version: 2,
                description: "Uppercases a field".to_string(),
                properties: vec![NodeProperty {
                    name: "field".to_string(),
                    display_name: "Field".to_string(),
                    kind: ParameterKind::String,
                    default: json!("text"),
                    required: false,
                }],
                inputs: vec!["main".to_string()],
                outputs: vec!["main".to_string()],
            }
        }

        async fn execute(
            &self,
            _node: &NodeInstance,
            ctx: &ExecutionContext,
        ) -> anyhow::Result<serde_json::Value> {
            let text = ctx
                .input_field("text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("text is required"))?;
            Ok(json!({ "text": text.to_uppercase() }))
        }
    }

    struct Panics;

    #[async_trait::async_trait]
    impl Node for Panics {
        fn definition(&self) -> NodeDefinition {
            NodeDefinition::new("panics", "action")
        }

        async fn execute(&self, _node: &NodeInstance, _ctx: &ExecutionContext) -> ExecutionResult {
            panic!("connector exploded")
        }
    }

    fn instance(id: &str) -> NodeInstance {
        NodeInstance {
            id: id.to_string(),
            node_type: id.to_string(),
            config: json!({}),
        }
    }

    #[test]
    fn test_versioned_description_is_normalized() {
        let registry = NodeRegistry::new();
        registry.register(NodePlugin::versioned(Upper)).unwrap();

        let resolved = registry.resolve("upper").unwrap();
        assert_eq!(resolved.definition.name, "Uppercase");
        assert_eq!(resolved.definition.category, "transform");
        assert_eq!(resolved.definition.version, 2);
        assert_eq!(resolved.definition.parameters[0].default, Some(json!("text")));
        assert_eq!(resolved.definition.inputs, vec![NodePort::json("main")]);
        assert!(resolved.handle.is_versioned());
    }

    #[tokio::test]
    async fn test_both_shapes_execute_through_one_handle_type() {
        let registry = NodeRegistry::new();
        registry.register(NodePlugin::legacy(Echo { id: "echo", tag: "a" })).unwrap();
        registry.register(NodePlugin::versioned(Upper)).unwrap();

        let ctx = ExecutionContext::new(RunId::new("r1"), "n", json!({"text": "hi"}));

        let legacy = registry.resolve("echo").unwrap();
        let result = legacy.handle.execute(&instance("echo"), &ctx).await;
        assert!(result.success);
        assert_eq!(result.output, Some(json!({"tag": "a"})));

        let versioned = registry.resolve("upper").unwrap();
        let result = versioned.handle.execute(&instance("upper"), &ctx).await;
        assert_eq!(result.output, Some(json!({"text": "HI"})));

        let ctx = ExecutionContext::new(RunId::new("r1"), "n", json!({}));
        let result = versioned.handle.execute(&instance("upper"), &ctx).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("text is required"));
    }

    #[tokio::test]
    async fn test_panicking_node_becomes_failure() {
        let registry = NodeRegistry::new();
        registry.register(NodePlugin::legacy(Panics)).unwrap();

        let ctx = ExecutionContext::new(RunId::new("r1"), "p", json!({}));
        let result = registry
            .resolve("panics")
            .unwrap()
            .handle
            .execute(&instance("panics"), &ctx)
            .await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("node panicked: connector exploded"));
    }

    #[test]
    fn test_alias_resolution() {
        let registry = NodeRegistry::new();
        registry.register(NodePlugin::legacy(Echo { id: "echo", tag: "a" })).unwrap();
        registry.alias("legacyEcho", "echo");
        registry.alias("ghost", "does-not-exist");

        assert_eq!(registry.resolve("legacyEcho").unwrap().definition.id, "echo");
        assert!(matches!(
            registry.resolve("ghost"),
            Err(RegistryError::NotFound(id)) if id == "ghost"
        ));
        assert!(matches!(registry.resolve("nope"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let registry = NodeRegistry::new();
        registry.register(NodePlugin::legacy(Echo { id: "echo", tag: "a" })).unwrap();

        let first = registry.resolve("echo").unwrap();
        let second = registry.resolve("echo").unwrap();
        assert!(first.handle.same_implementation(&second.handle));
        assert!(Arc::ptr_eq(&first.definition, &second.definition));
    }

    #[tokio::test]
    async fn test_duplicate_registration_last_wins() {
        let registry = NodeRegistry::new();
        registry.register(NodePlugin::legacy(Echo { id: "echo", tag: "first" })).unwrap();
        registry.register(NodePlugin::legacy(Echo { id: "echo", tag: "second" })).unwrap();

        assert_eq!(registry.len(), 1);
        let ctx = ExecutionContext::new(RunId::new("r1"), "n", json!({}));
        let result = registry
            .resolve("echo")
            .unwrap()
            .handle
            .execute(&instance("echo"), &ctx)
            .await;
        assert_eq!(result.output, Some(json!({"tag": "second"})));
    }

    #[test]
    fn test_invalid_definitions_rejected() {
        let registry = NodeRegistry::new();

        let err = registry
            .register(NodePlugin::legacy(Echo { id: "", tag: "a" }))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidDefinition { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_load_catalog_skips_broken_plugins() {
        let mut catalog = PluginCatalog::new();
        catalog.add(NodeCategory::Transform, "echo", || {
            Ok(NodePlugin::legacy(Echo { id: "echo", tag: "a" }))
        });
        catalog.add(NodeCategory::Integration, "broken", || {
            Err(anyhow::anyhow!("missing native library"))
        });
        catalog.add(NodeCategory::Action, "nameless", || {
            Ok(NodePlugin::legacy(Echo { id: " ", tag: "a" }))
        });
        catalog.add(NodeCategory::Transform, "upper", || Ok(NodePlugin::versioned(Upper)));
        catalog.alias("shout", "upper");

        let registry = NodeRegistry::new();
        let report = registry.load_catalog(&catalog);

        assert_eq!(report.loaded, vec!["echo".to_string(), "upper".to_string()]);
        let skipped: Vec<_> = report.skipped.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(skipped, vec!["nameless", "broken"]);
        assert!(report.skipped[1].reason.contains("missing native library"));
        assert!(registry.contains("shout"));
        assert_eq!(
            registry.definitions().iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            vec!["echo", "upper"]
        );
    }
}
