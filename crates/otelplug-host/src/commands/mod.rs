//! Operator commands over the plugin manager.
//!
//! Each command is built from an [`AppContext`] and returns data; rendering
//! is left to the caller.

use std::collections::BTreeMap;
use std::sync::Arc;

use otelplug_ipc::{CallContext, PluginHealth, PluginMetadata};

use crate::error::PluginError;
use crate::loader::Loader;
use crate::manager::{PluginManager, PluginStatus};

/// Shared state injected into every command.
#[derive(Debug, Clone)]
pub struct AppContext {
    manager: PluginManager,
    loader: Loader,
}

impl AppContext {
    /// Wraps the single manager for the process.
    #[must_use]
    pub fn new(manager: PluginManager) -> Arc<Self> {
        let loader = Loader::new(manager.clone());
        Arc::new(Self { manager, loader })
    }

    /// The plugin manager.
    #[must_use]
    pub const fn manager(&self) -> &PluginManager {
        &self.manager
    }

    /// The loader sharing the manager.
    #[must_use]
    pub const fn loader(&self) -> &Loader {
        &self.loader
    }
}

/// Lists loaded plugins.
#[derive(Debug, Clone)]
pub struct ListCommand {
    app: Arc<AppContext>,
}

impl ListCommand {
    /// Builds the command.
    #[must_use]
    pub const fn new(app: Arc<AppContext>) -> Self {
        Self { app }
    }

    /// Metadata of every loaded plugin, sorted by name.
    #[must_use]
    pub fn execute(&self) -> Vec<PluginMetadata> {
        self.app.manager().list()
    }
}

/// Describes one loaded plugin.
#[derive(Debug, Clone)]
pub struct InfoCommand {
    app: Arc<AppContext>,
    name: String,
}

impl InfoCommand {
    /// Builds the command for `name`.
    #[must_use]
    pub fn new(app: Arc<AppContext>, name: impl Into<String>) -> Self {
        Self {
            app,
            name: name.into(),
        }
    }

    /// Status of the plugin, or [`PluginError::NotLoaded`].
    pub fn execute(&self) -> Result<PluginStatus, PluginError> {
        self.app
            .manager()
            .info(&self.name)
            .ok_or_else(|| PluginError::NotLoaded {
                name: self.name.clone(),
            })
    }
}

/// Starts a loaded plugin.
#[derive(Debug, Clone)]
pub struct EnableCommand {
    app: Arc<AppContext>,
    name: String,
}

impl EnableCommand {
    /// Builds the command for `name`.
    #[must_use]
    pub fn new(app: Arc<AppContext>, name: impl Into<String>) -> Self {
        Self {
            app,
            name: name.into(),
        }
    }

    /// Sends `Start` and returns the reported health.
    pub fn execute(&self, ctx: &CallContext) -> Result<PluginHealth, PluginError> {
        self.app.manager().start(ctx, &self.name)
    }
}

/// Stops a running plugin.
#[derive(Debug, Clone)]
pub struct DisableCommand {
    app: Arc<AppContext>,
    name: String,
}

impl DisableCommand {
    /// Builds the command for `name`.
    #[must_use]
    pub fn new(app: Arc<AppContext>, name: impl Into<String>) -> Self {
        Self {
            app,
            name: name.into(),
        }
    }

    /// Sends `Stop` and returns the reported health.
    pub fn execute(&self, ctx: &CallContext) -> Result<PluginHealth, PluginError> {
        self.app.manager().stop(ctx, &self.name)
    }
}

/// Checks the health of every loaded plugin.
#[derive(Debug, Clone)]
pub struct HealthCommand {
    app: Arc<AppContext>,
}

impl HealthCommand {
    /// Builds the command.
    #[must_use]
    pub const fn new(app: Arc<AppContext>) -> Self {
        Self { app }
    }

    /// Health of every loaded plugin, keyed by name.
    #[must_use]
    pub fn execute(&self, ctx: &CallContext) -> BTreeMap<String, PluginHealth> {
        self.app.manager().check_health(ctx)
    }
}
