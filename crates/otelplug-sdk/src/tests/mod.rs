//! Crate-level behaviour tests driving the server over a real session.

use otelplug_ipc::{FactoryDescriptor, PluginMetadata, PluginType, Stability};

use crate::handler::PluginHandler;


/// Minimal handler used by the behaviour tests.
struct StaticPlugin {
    metadata: PluginMetadata,
}

impl StaticPlugin {
    fn new(plugin_type: PluginType, name: &str, version: &str) -> Self {
        Self {
            metadata: PluginMetadata::new(name, plugin_type, version),
        }
    }
}

impl PluginHandler for StaticPlugin {
    fn metadata(&self) -> PluginMetadata {
        self.metadata.clone()
    }

    fn factory(&self) -> Result<FactoryDescriptor, String> {
        Ok(FactoryDescriptor::new(
            self.metadata.name(),
            self.metadata.plugin_type(),
            Stability::Alpha,
        ))
    }
}
