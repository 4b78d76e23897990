//! Plugin directory discovery and factory aggregation.

mod factory;

use std::fs;
use std::io;
use std::sync::Arc;
use std::thread;

use camino::{Utf8Path, Utf8PathBuf};
use otelplug_ipc::{CallContext, Method, PluginMetadata, PluginType};
use tracing::{debug, info, warn};

pub use self::factory::{ComponentFactory, Factories, RemoteFactory};
use crate::error::PluginError;
use crate::manager::PluginManager;

const LOADER_TARGET: &str = "otelplug_host::loader";

/// One plugin that could not be loaded.
#[derive(Debug, Clone)]
pub struct LoadFailure {
    /// Type implied by the subdirectory.
    pub plugin_type: PluginType,
    /// File name of the binary.
    pub name: String,
    /// Binary path.
    pub path: Utf8PathBuf,
    /// Why loading failed.
    pub error: PluginError,
}

/// Outcome of a directory scan.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Metadata confirmed by each plugin loaded during the scan.
    pub loaded: Vec<PluginMetadata>,
    /// Plugins that failed to load.
    pub failures: Vec<LoadFailure>,
}

impl LoadReport {
    /// Reports whether every discovered plugin loaded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Discovers plugin binaries and loads them through a [`PluginManager`].
#[derive(Debug, Clone)]
pub struct Loader {
    manager: PluginManager,
}

impl Loader {
    /// Creates a loader that registers plugins with `manager`.
    #[must_use]
    pub const fn new(manager: PluginManager) -> Self {
        Self { manager }
    }

    /// The manager plugins are loaded into.
    #[must_use]
    pub const fn manager(&self) -> &PluginManager {
        &self.manager
    }

    /// Loads every plugin binary below `dir`.
    ///
    /// Creates the four typed subdirectories when missing, then visits each
    /// regular file (following symlinks, skipping dot-files) in name order.
    /// A plugin that fails is recorded in the report and the scan continues;
    /// only an unreadable directory aborts it.
    pub fn load_plugins(&self, ctx: &CallContext, dir: &Utf8Path) -> Result<LoadReport, PluginError> {
        let mut report = LoadReport::default();
        for plugin_type in PluginType::ALL {
            let type_dir = dir.join(plugin_type.directory_name());
            for (name, path) in discover(&type_dir)? {
                let expected = PluginMetadata::new(name.as_str(), plugin_type, "");
                match self.manager.load_path(ctx, expected, &path) {
                    Ok(_) => {
                        if let Some(status) = self.manager.info(&name) {
                            report.loaded.push(status.metadata);
                        }
                    }
                    Err(error) => {
                        warn!(
                            target: LOADER_TARGET,
                            plugin = %name,
                            plugin_type = %plugin_type,
                            error = %error,
                            "skipping plugin that failed to load"
                        );
                        report.failures.push(LoadFailure {
                            plugin_type,
                            name,
                            path,
                            error,
                        });
                    }
                }
            }
        }
        info!(
            target: LOADER_TARGET,
            dir = %dir,
            loaded = report.loaded.len(),
            failed = report.failures.len(),
            "plugin scan finished"
        );
        Ok(report)
    }

    /// Collects the factory of every loaded plugin, keyed `"<type>/<name>"`.
    ///
    /// Requests run concurrently; plugins whose factory call fails, or whose
    /// descriptor names a different plugin type than the handshake confirmed,
    /// are logged and left out.
    #[must_use]
    pub fn get_factories(&self, ctx: &CallContext) -> Factories {
        let loaded = self.manager.loaded();
        let fetched: Vec<_> = thread::scope(|scope| {
            let requests: Vec<_> = loaded
                .iter()
                .map(|(metadata, client)| (metadata, client, scope.spawn(move || client.factory(ctx))))
                .collect();
            requests
                .into_iter()
                .map(|(metadata, client, request)| {
                    let outcome = request.join().unwrap_or_else(|_| {
                        Err(PluginError::Remote {
                            name: metadata.name().to_owned(),
                            method: Method::GetFactory,
                            message: "factory request panicked".to_owned(),
                        })
                    });
                    (metadata, client, outcome)
                })
                .collect()
        });

        let mut factories = Factories::default();
        for (metadata, client, outcome) in fetched {
            match outcome {
                Ok(descriptor) if descriptor.plugin_type() != metadata.plugin_type() => warn!(
                    target: LOADER_TARGET,
                    plugin = metadata.name(),
                    loaded_as = %metadata.plugin_type(),
                    described_as = %descriptor.plugin_type(),
                    "excluding plugin whose factory describes another plugin type"
                ),
                Ok(descriptor) => {
                    let factory = RemoteFactory::new(metadata, descriptor, client.clone());
                    factories.insert(metadata, Arc::new(factory));
                }
                Err(error) => warn!(
                    target: LOADER_TARGET,
                    plugin = metadata.name(),
                    error = %error,
                    "excluding plugin whose factory is unavailable"
                ),
            }
        }
        factories
    }
}

/// Regular files in `dir`, sorted by name. Creates `dir` when missing.
fn discover(dir: &Utf8Path) -> Result<Vec<(String, Utf8PathBuf)>, PluginError> {
    let discovery = |source: io::Error| PluginError::Discovery {
        path: dir.to_path_buf(),
        source: Arc::new(source),
    };
    fs::create_dir_all(dir.as_std_path()).map_err(discovery)?;
    let mut found = Vec::new();
    for entry in fs::read_dir(dir.as_std_path()).map_err(discovery)? {
        let entry = entry.map_err(discovery)?;
        let Ok(name) = entry.file_name().into_string() else {
            warn!(target: LOADER_TARGET, dir = %dir, "skipping non-UTF-8 file name");
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let path = dir.join(&name);
        if !fs::metadata(path.as_std_path()).is_ok_and(|meta| meta.is_file()) {
            debug!(target: LOADER_TARGET, path = %path, "skipping non-file entry");
            continue;
        }
        found.push((name, path));
    }
    found.sort_unstable_by(|left, right| left.0.cmp(&right.0));
    Ok(found)
}
