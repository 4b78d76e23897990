//! Component factories handed to the pipeline assembler.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use otelplug_ipc::{FactoryDescriptor, PluginMetadata, PluginType, Stability};
use serde_json::Value;

use crate::client::PluginClient;

/// A constructor descriptor for one pipeline component.
pub trait ComponentFactory: Send + Sync + fmt::Debug {
    /// Namespaced component type, `"<type>/<name>"` of the serving plugin.
    fn component_type(&self) -> &str;

    /// Component type id as the plugin itself declared it.
    fn declared_type(&self) -> &str;

    /// Kind of component produced.
    fn plugin_type(&self) -> PluginType;

    /// Maturity of the component.
    fn stability(&self) -> Stability;

    /// Default configuration for new components.
    fn default_config(&self) -> &Value;
}

/// Factory served by a loaded plugin process.
#[derive(Debug, Clone)]
pub struct RemoteFactory {
    plugin: String,
    component_type: String,
    descriptor: FactoryDescriptor,
    client: PluginClient,
}

impl RemoteFactory {
    /// Wraps the descriptor the plugin described by `metadata` returned.
    #[must_use]
    pub fn new(metadata: &PluginMetadata, descriptor: FactoryDescriptor, client: PluginClient) -> Self {
        Self {
            plugin: metadata.name().to_owned(),
            component_type: metadata.qualified_name(),
            descriptor,
            client,
        }
    }

    /// Name of the plugin serving this factory.
    #[must_use]
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Client for the plugin serving this factory.
    #[must_use]
    pub const fn client(&self) -> &PluginClient {
        &self.client
    }
}

impl ComponentFactory for RemoteFactory {
    fn component_type(&self) -> &str {
        &self.component_type
    }

    fn declared_type(&self) -> &str {
        self.descriptor.component_type()
    }

    fn plugin_type(&self) -> PluginType {
        self.descriptor.plugin_type()
    }

    fn stability(&self) -> Stability {
        self.descriptor.stability()
    }

    fn default_config(&self) -> &Value {
        self.descriptor.default_config()
    }
}

/// Factories bucketed by plugin type, keyed `"<type>/<name>"`.
#[derive(Debug, Clone, Default)]
pub struct Factories {
    /// Receiver factories.
    pub receivers: BTreeMap<String, Arc<dyn ComponentFactory>>,
    /// Processor factories.
    pub processors: BTreeMap<String, Arc<dyn ComponentFactory>>,
    /// Exporter factories.
    pub exporters: BTreeMap<String, Arc<dyn ComponentFactory>>,
    /// Extension factories.
    pub extensions: BTreeMap<String, Arc<dyn ComponentFactory>>,
}

impl Factories {
    /// Files `factory` under the loaded plugin's type and qualified name.
    pub fn insert(&mut self, plugin: &PluginMetadata, factory: Arc<dyn ComponentFactory>) {
        self.bucket_mut(plugin.plugin_type())
            .insert(plugin.qualified_name(), factory);
    }

    /// Looks a factory up by `"<type>/<name>"`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Arc<dyn ComponentFactory>> {
        PluginType::ALL
            .iter()
            .find_map(|plugin_type| self.bucket(*plugin_type).get(key))
    }

    /// Factories of one type.
    #[must_use]
    pub const fn bucket(&self, plugin_type: PluginType) -> &BTreeMap<String, Arc<dyn ComponentFactory>> {
        match plugin_type {
            PluginType::Receiver => &self.receivers,
            PluginType::Processor => &self.processors,
            PluginType::Exporter => &self.exporters,
            PluginType::Extension => &self.extensions,
        }
    }

    const fn bucket_mut(
        &mut self,
        plugin_type: PluginType,
    ) -> &mut BTreeMap<String, Arc<dyn ComponentFactory>> {
        match plugin_type {
            PluginType::Receiver => &mut self.receivers,
            PluginType::Processor => &mut self.processors,
            PluginType::Exporter => &mut self.exporters,
            PluginType::Extension => &mut self.extensions,
        }
    }

    /// Total number of factories.
    #[must_use]
    pub fn len(&self) -> usize {
        PluginType::ALL
            .iter()
            .map(|plugin_type| self.bucket(*plugin_type).len())
            .sum()
    }

    /// Reports whether no factories were collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
