//! Structured reporting of plugin lifecycle events.

use std::sync::Arc;

use camino::Utf8Path;
use otelplug_ipc::{PluginMetadata, PluginType};

use crate::error::PluginError;
use crate::process::ProcessExit;

/// Observer trait used to surface plugin lifecycle events to telemetry sinks.
pub trait PluginEventReporter: Send + Sync {
    /// Invoked before a plugin process is spawned.
    fn loading(&self, plugin_type: PluginType, name: &str, binary: &Utf8Path);

    /// Invoked after the handshake succeeds and the plugin is registered.
    fn loaded(&self, metadata: &PluginMetadata, pid: Option<u32>);

    /// Invoked when a load attempt fails.
    fn load_failed(&self, error: &PluginError);

    /// Invoked after a plugin is unloaded and its process reaped.
    fn unloaded(&self, name: &str, exit: Option<ProcessExit>);

    /// Invoked when a plugin process exits without being unloaded.
    fn exited(&self, name: &str, exit: ProcessExit);
}

impl<T> PluginEventReporter for Arc<T>
where
    T: PluginEventReporter + ?Sized,
{
    fn loading(&self, plugin_type: PluginType, name: &str, binary: &Utf8Path) {
        (**self).loading(plugin_type, name, binary);
    }

    fn loaded(&self, metadata: &PluginMetadata, pid: Option<u32>) {
        (**self).loaded(metadata, pid);
    }

    fn load_failed(&self, error: &PluginError) {
        (**self).load_failed(error);
    }

    fn unloaded(&self, name: &str, exit: Option<ProcessExit>) {
        (**self).unloaded(name, exit);
    }

    fn exited(&self, name: &str, exit: ProcessExit) {
        (**self).exited(name, exit);
    }
}

/// Default reporter that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredEventReporter;

impl StructuredEventReporter {
    /// Builds a new reporter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl PluginEventReporter for StructuredEventReporter {
    fn loading(&self, plugin_type: PluginType, name: &str, binary: &Utf8Path) {
        tracing::info!(
            target: "otelplug_host::events",
            event = "plugin_loading",
            plugin = name,
            plugin_type = %plugin_type,
            binary = %binary,
            "loading plugin"
        );
    }

    fn loaded(&self, metadata: &PluginMetadata, pid: Option<u32>) {
        tracing::info!(
            target: "otelplug_host::events",
            event = "plugin_loaded",
            plugin = metadata.name(),
            plugin_type = %metadata.plugin_type(),
            version = metadata.version(),
            sha256 = metadata.sha256().unwrap_or_default(),
            pid = ?pid,
            "plugin loaded"
        );
    }

    fn load_failed(&self, error: &PluginError) {
        tracing::error!(
            target: "otelplug_host::events",
            event = "plugin_load_failed",
            plugin = error.plugin_name().unwrap_or_default(),
            phase = %error.phase(),
            error = %error,
            "plugin load failed"
        );
    }

    fn unloaded(&self, name: &str, exit: Option<ProcessExit>) {
        tracing::info!(
            target: "otelplug_host::events",
            event = "plugin_unloaded",
            plugin = name,
            exit = exit.map(|exit| exit.to_string()).unwrap_or_default(),
            "plugin unloaded"
        );
    }

    fn exited(&self, name: &str, exit: ProcessExit) {
        tracing::warn!(
            target: "otelplug_host::events",
            event = "plugin_exited",
            plugin = name,
            exit = %exit,
            "plugin process exited unexpectedly"
        );
    }
}
