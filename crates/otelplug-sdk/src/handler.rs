use otelplug_ipc::{FactoryDescriptor, PluginHealth, PluginMetadata};

/// Behaviour a plugin supplies to the SDK server.
///
/// Only [`metadata`](Self::metadata) and [`factory`](Self::factory) are
/// required. Hooks return `Err(message)` to fail a request; the message is
/// relayed to the host verbatim.
pub trait PluginHandler: Send + Sync + 'static {
    /// The plugin's own identity.
    fn metadata(&self) -> PluginMetadata;

    /// Describes the component factory handed to the pipeline assembler.
    fn factory(&self) -> Result<FactoryDescriptor, String>;

    /// Extra acceptance check for the host's declared metadata.
    ///
    /// Runs after the SDK has matched name, type, version and capabilities.
    fn accept(&self, _declared: &PluginMetadata) -> Result<(), String> {
        Ok(())
    }

    /// Called when the plugin transitions to started.
    fn on_start(&self) -> Result<(), String> {
        Ok(())
    }

    /// Called when the plugin transitions to stopped.
    fn on_stop(&self) -> Result<(), String> {
        Ok(())
    }

    /// Fresh health observation, or `None` to keep the current status.
    fn observe_health(&self) -> Option<PluginHealth> {
        None
    }
}
