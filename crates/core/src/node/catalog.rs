use super::registry::NodePlugin;
use serde::{Deserialize, Serialize};

/// Fixed set of plugin categories, visited in this order when loading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCategory {
    Trigger,
    Action,
    Transform,
    Flow,
    Ai,
    Integration,
}

impl NodeCategory {
    pub const ALL: [NodeCategory; 6] = [
        NodeCategory::Trigger,
        NodeCategory::Action,
        NodeCategory::Transform,
        NodeCategory::Flow,
        NodeCategory::Ai,
        NodeCategory::Integration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Action => "action",
            Self::Transform => "transform",
            Self::Flow => "flow",
            Self::Ai => "ai",
            Self::Integration => "integration",
        }
    }
}

impl std::fmt::Display for NodeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Constructor for one plugin; failures are reported, not propagated
pub type PluginLoader = Box<dyn Fn() -> anyhow::Result<NodePlugin> + Send + Sync>;

/// One statically known plugin
pub struct PluginSource {
    pub name: String,
    pub category: NodeCategory,
    pub loader: PluginLoader,
}

/// Compiled-in list of plugins and aliases the registry loads at startup
#[derive(Default)]
pub struct PluginCatalog {
    sources: Vec<PluginSource>,
    aliases: Vec<(String, String)>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&mut self, category: NodeCategory, name: impl Into<String>, loader: F) -> &mut Self
    where
        F: Fn() -> anyhow::Result<NodePlugin> + Send + Sync + 'static,
    {
        self.sources.push(PluginSource {
            name: name.into(),
            category,
            loader: Box::new(loader),
        });
        self
    }

    /// Register a deprecated id that should resolve to `to`
    pub fn alias(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.aliases.push((from.into(), to.into()));
        self
    }

    pub fn sources_in(&self, category: NodeCategory) -> impl Iterator<Item = &PluginSource> {
        self.sources.iter().filter(move |s| s.category == category)
    }

    pub fn aliases(&self) -> &[(String, String)] {
        &self.aliases
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
