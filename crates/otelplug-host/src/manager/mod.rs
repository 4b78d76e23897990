//! The authoritative registry of loaded plugins.
//!
//! [`PluginManager`] owns every plugin instance. The table sits behind a
//! single `RwLock`: lookups and sweeps take it shared, registration and
//! removal take it exclusively, and no IPC happens while it is held. A
//! separate reservation set rejects a second load of a name that is still
//! handshaking.

mod instance;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::thread;

use camino::Utf8Path;
use otelplug_config::{Config, prepare_runtime_dir};
use otelplug_ipc::{
    CallContext, FactoryDescriptor, IpcAddress, PluginHealth, PluginMetadata, PluginType,
    RendezvousListener, SharedRegion, TransportError,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

pub use self::instance::{Lifecycle, PluginStatus};
use self::instance::{LoadAttempt, PluginInstance};
use crate::client::{CallTimeouts, PluginClient, budget_ms};
use crate::error::{Phase, PluginError};
use crate::events::{PluginEventReporter, StructuredEventReporter};
use crate::pool::StreamPool;
use crate::process::{PluginLauncher, PluginProcess, ProcessExit, Supervisor, SystemLauncher};

pub(crate) const MANAGER_TARGET: &str = "otelplug_host::manager";

struct ManagerShared {
    config: Config,
    timeouts: CallTimeouts,
    launcher: Arc<dyn PluginLauncher>,
    reporter: Arc<dyn PluginEventReporter>,
    table: RwLock<BTreeMap<String, Arc<PluginInstance>>>,
    loading: Mutex<HashSet<String>>,
    next_id: AtomicU64,
}

impl ManagerShared {
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<PluginInstance>>> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<PluginInstance>>> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, name: &str) -> Result<Arc<PluginInstance>, PluginError> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::NotLoaded {
                name: name.to_owned(),
            })
    }

    /// Removes `name` only while it still maps to instance `id`.
    fn remove_instance(&self, name: &str, id: u64) -> Option<Arc<PluginInstance>> {
        let mut table = self.write();
        if table.get(name).is_some_and(|instance| instance.id() == id) {
            table.remove(name)
        } else {
            None
        }
    }
}

/// Releases a name reservation when a load attempt ends.
struct Reservation<'a> {
    loading: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.loading
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

/// Loads, supervises and unloads plugin processes.
///
/// Cloning is cheap; clones share one table.
#[derive(Clone)]
pub struct PluginManager {
    shared: Arc<ManagerShared>,
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugin_dir", &self.shared.config.plugin_dir())
            .field("runtime_dir", &self.shared.config.runtime_dir())
            .field("loaded", &self.shared.read().len())
            .finish_non_exhaustive()
    }
}

impl PluginManager {
    /// Creates a manager that spawns child processes and logs lifecycle
    /// events through `tracing`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_parts(
            config,
            Arc::new(SystemLauncher),
            Arc::new(StructuredEventReporter::new()),
        )
    }

    /// Creates a manager with an explicit launcher and event reporter.
    #[must_use]
    pub fn with_parts(
        config: Config,
        launcher: Arc<dyn PluginLauncher>,
        reporter: Arc<dyn PluginEventReporter>,
    ) -> Self {
        let timeouts = CallTimeouts::from_config(&config);
        Self {
            shared: Arc::new(ManagerShared {
                config,
                timeouts,
                launcher,
                reporter,
                table: RwLock::new(BTreeMap::new()),
                loading: Mutex::new(HashSet::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Configuration the manager was built with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Resolves `<plugin_dir>/<type dir>/<name>` and loads it.
    ///
    /// The binary's SHA-256 is computed and recorded in the expected
    /// metadata; it is not verified.
    pub fn load(
        &self,
        ctx: &CallContext,
        plugin_type: PluginType,
        name: &str,
    ) -> Result<PluginClient, PluginError> {
        let path = self
            .shared
            .config
            .plugin_dir()
            .join(plugin_type.directory_name())
            .join(name);
        let is_file = fs::metadata(path.as_std_path()).is_ok_and(|meta| meta.is_file());
        if !is_file {
            return Err(PluginError::BinaryNotFound {
                name: name.to_owned(),
                plugin_type,
                path,
            });
        }
        let expected = PluginMetadata::new(name, plugin_type, "");
        self.load_path(ctx, expected, &path)
    }

    /// Digests `path`, records the digest in `expected` and loads it.
    pub fn load_path(
        &self,
        ctx: &CallContext,
        expected: PluginMetadata,
        path: &Utf8Path,
    ) -> Result<PluginClient, PluginError> {
        let digest = sha256_file(path).map_err(|source| PluginError::Digest {
            name: expected.name().to_owned(),
            plugin_type: expected.plugin_type(),
            path: path.to_path_buf(),
            source: Arc::new(source),
        })?;
        self.load_binary(ctx, &expected.with_sha256(digest), path)
    }

    /// Spawns `binary`, performs the handshake and registers the plugin.
    ///
    /// On failure nothing is registered, the process is killed and reaped,
    /// and the rendezvous socket and shared-memory region are removed.
    pub fn load_binary(
        &self,
        ctx: &CallContext,
        expected: &PluginMetadata,
        binary: &Utf8Path,
    ) -> Result<PluginClient, PluginError> {
        let result = self
            .reserve(expected.name())
            .and_then(|reservation| self.load_reserved(ctx, expected, binary, &reservation));
        if let Err(error) = &result {
            self.shared.reporter.load_failed(error);
        }
        result
    }

    fn reserve(&self, name: &str) -> Result<Reservation<'_>, PluginError> {
        let mut loading = self
            .shared
            .loading
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if loading.contains(name) || self.shared.read().contains_key(name) {
            return Err(PluginError::AlreadyLoaded {
                name: name.to_owned(),
            });
        }
        loading.insert(name.to_owned());
        Ok(Reservation {
            loading: &self.shared.loading,
            name: name.to_owned(),
        })
    }

    fn load_reserved(
        &self,
        ctx: &CallContext,
        expected: &PluginMetadata,
        binary: &Utf8Path,
        reservation: &Reservation<'_>,
    ) -> Result<PluginClient, PluginError> {
        let shared = &self.shared;
        let name = reservation.name.as_str();
        let plugin_type = expected.plugin_type();
        shared.reporter.loading(plugin_type, name, binary);

        let runtime_dir = shared.config.runtime_dir();
        prepare_runtime_dir(runtime_dir).map_err(|source| PluginError::RuntimeDirectory {
            name: name.to_owned(),
            plugin_type,
            source,
        })?;
        let rendezvous = |source: TransportError| PluginError::Rendezvous {
            name: name.to_owned(),
            plugin_type,
            source,
        };
        let address = IpcAddress::unique(runtime_dir, plugin_type, name).map_err(rendezvous)?;
        let region = SharedRegion::create(&address.region_path(), shared.config.ring_capacity())
            .map_err(rendezvous)?;
        let mut attempt = LoadAttempt::new(name, &address);
        let listener = RendezvousListener::bind(&address)
            .map_err(rendezvous)?
            .with_region(region);
        attempt.track_socket();

        let process: Arc<dyn PluginProcess> = shared
            .launcher
            .launch(binary, &address)
            .map_err(|source| PluginError::Spawn {
                name: name.to_owned(),
                plugin_type,
                path: binary.to_path_buf(),
                source: Arc::new(source),
            })?
            .into();
        attempt.track_process(Arc::clone(&process));

        let init_ctx = ctx.child(shared.timeouts.initialize);
        let session = listener
            .accept_session(&init_ctx, || matches!(process.try_wait(), Ok(None)))
            .map_err(|source| connect_error(&init_ctx, name, plugin_type, source))?;
        let session = Arc::new(session);
        attempt.track_session(Arc::clone(&session));

        let pool = Arc::new(StreamPool::new(session, shared.config.stream_pool_size()));
        let client = PluginClient::new(name, pool, shared.timeouts);
        let confirmed = client
            .initialize(&init_ctx, expected)
            .map_err(|error| error.into_handshake(plugin_type))?;
        if confirmed.name() != expected.name() || confirmed.plugin_type() != plugin_type {
            return Err(PluginError::Handshake {
                name: name.to_owned(),
                plugin_type,
                message: format!(
                    "plugin confirmed identity '{}', expected '{}'",
                    confirmed.qualified_name(),
                    expected.qualified_name()
                ),
            });
        }

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let instance = Arc::new(PluginInstance::new(
            id,
            confirmed,
            binary.to_path_buf(),
            address.clone(),
            client.clone(),
            Arc::clone(&process),
        ));
        attempt.commit();
        shared.write().insert(name.to_owned(), Arc::clone(&instance));
        shared.reporter.loaded(instance.metadata(), process.id());

        // The entry must be visible before the watcher can observe an exit.
        match self.watch(&instance) {
            Ok(supervisor) => {
                instance.attach_supervisor(supervisor);
                Ok(client)
            }
            Err(source) => {
                shared.remove_instance(name, id);
                if let Err(error) = instance.shut_down(shared.config.shutdown_grace()) {
                    debug!(
                        target: MANAGER_TARGET,
                        plugin = name,
                        error = %error,
                        "cleanup after watcher failure failed"
                    );
                }
                Err(PluginError::Spawn {
                    name: name.to_owned(),
                    plugin_type,
                    path: binary.to_path_buf(),
                    source: Arc::new(source),
                })
            }
        }
    }

    fn watch(&self, instance: &Arc<PluginInstance>) -> io::Result<Supervisor> {
        let shared = Arc::downgrade(&self.shared);
        let watched = Arc::downgrade(instance);
        let name = instance.name().to_owned();
        let id = instance.id();
        Supervisor::spawn(instance.name(), instance.process(), move |exit| {
            on_unexpected_exit(&shared, &watched, &name, id, exit);
        })
    }

    /// Client for a loaded plugin.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<PluginClient> {
        self.shared
            .read()
            .get(name)
            .map(|instance| instance.client().clone())
    }

    /// Metadata of every loaded plugin, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<PluginMetadata> {
        self.shared
            .read()
            .values()
            .map(|instance| instance.metadata().clone())
            .collect()
    }

    /// Status snapshot of a loaded plugin.
    #[must_use]
    pub fn info(&self, name: &str) -> Option<PluginStatus> {
        self.shared.read().get(name).map(|instance| instance.status())
    }

    /// Sends `HealthCheck` to every loaded plugin concurrently.
    ///
    /// Each check runs on its own thread with the configured health budget.
    /// A failed check is reported as `failed` health, never omitted.
    #[must_use]
    pub fn check_health(&self, ctx: &CallContext) -> BTreeMap<String, PluginHealth> {
        let instances = self.snapshot();
        thread::scope(|scope| {
            let checks: Vec<_> = instances
                .iter()
                .map(|instance| {
                    (
                        instance.name(),
                        scope.spawn(move || observe_health(ctx, instance)),
                    )
                })
                .collect();
            checks
                .into_iter()
                .map(|(name, check)| {
                    let health = check.join().unwrap_or_else(|_| {
                        PluginHealth::failed("health check failed", "health check panicked")
                    });
                    (name.to_owned(), health)
                })
                .collect()
        })
    }

    /// Factory of the first loaded plugin (by name) of `plugin_type`.
    pub fn get_factory(
        &self,
        ctx: &CallContext,
        plugin_type: PluginType,
    ) -> Result<FactoryDescriptor, PluginError> {
        let client = self
            .shared
            .read()
            .values()
            .find(|instance| instance.metadata().plugin_type() == plugin_type)
            .map(|instance| instance.client().clone())
            .ok_or(PluginError::NoFactory { plugin_type })?;
        client.factory(ctx)
    }

    /// Factory of the named plugin.
    pub fn factory_for(
        &self,
        ctx: &CallContext,
        name: &str,
    ) -> Result<FactoryDescriptor, PluginError> {
        let instance = self.shared.lookup(name)?;
        instance.client().factory(ctx)
    }

    /// Sends `Start`; the plugin becomes `Running`.
    pub fn start(&self, ctx: &CallContext, name: &str) -> Result<PluginHealth, PluginError> {
        let instance = self.shared.lookup(name)?;
        match instance.client().start(ctx) {
            Ok(health) => {
                instance.set_lifecycle(Lifecycle::Running);
                instance.record_health(health.clone());
                info!(target: MANAGER_TARGET, plugin = name, "plugin started");
                Ok(health)
            }
            Err(error @ PluginError::AlreadyStarted { .. }) => {
                instance.set_lifecycle(Lifecycle::Running);
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Sends `Stop`; the plugin returns to `Loaded`.
    pub fn stop(&self, ctx: &CallContext, name: &str) -> Result<PluginHealth, PluginError> {
        let instance = self.shared.lookup(name)?;
        match instance.client().stop(ctx) {
            Ok(health) => {
                instance.set_lifecycle(Lifecycle::Loaded);
                instance.record_health(health.clone());
                info!(target: MANAGER_TARGET, plugin = name, "plugin stopped");
                Ok(health)
            }
            Err(error @ PluginError::NotStarted { .. }) => {
                instance.set_lifecycle(Lifecycle::Loaded);
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Removes the plugin and terminates its process.
    ///
    /// Returns once the process has been reaped. The grace period before
    /// SIGKILL is the configured shutdown grace, shortened to whatever
    /// remains of `ctx`.
    pub fn unload(&self, ctx: &CallContext, name: &str) -> Result<(), PluginError> {
        let configured = self.shared.config.shutdown_grace();
        let grace = ctx
            .remaining()
            .map_or(configured, |left| left.min(configured));
        let instance = self
            .shared
            .write()
            .remove(name)
            .ok_or_else(|| PluginError::NotLoaded {
                name: name.to_owned(),
            })?;
        let exit = instance.shut_down(grace);
        match exit {
            Ok(exit) => {
                self.shared.reporter.unloaded(name, Some(exit));
                Ok(())
            }
            Err(error) => {
                self.shared.reporter.unloaded(name, None);
                Err(error)
            }
        }
    }

    /// Unloads every plugin, returning the failures.
    #[must_use]
    pub fn shutdown(&self, ctx: &CallContext) -> Vec<PluginError> {
        let names: Vec<String> = self.shared.read().keys().cloned().collect();
        names
            .iter()
            .filter_map(|name| match self.unload(ctx, name) {
                Ok(()) | Err(PluginError::NotLoaded { .. }) => None,
                Err(error) => Some(error),
            })
            .collect()
    }

    /// Metadata and client of every loaded plugin, sorted by name.
    pub(crate) fn loaded(&self) -> Vec<(PluginMetadata, PluginClient)> {
        self.snapshot()
            .iter()
            .map(|instance| (instance.metadata().clone(), instance.client().clone()))
            .collect()
    }

    fn snapshot(&self) -> Vec<Arc<PluginInstance>> {
        self.shared.read().values().cloned().collect()
    }
}

fn observe_health(ctx: &CallContext, instance: &PluginInstance) -> PluginHealth {
    let health = instance
        .client()
        .health_check(ctx)
        .unwrap_or_else(|error| {
            debug!(
                target: MANAGER_TARGET,
                plugin = instance.name(),
                error = %error,
                "health check failed"
            );
            PluginHealth::failed("health check failed", error.to_string())
        });
    instance.record_health(health.clone());
    health
}

fn on_unexpected_exit(
    shared: &Weak<ManagerShared>,
    watched: &Weak<PluginInstance>,
    name: &str,
    id: u64,
    exit: ProcessExit,
) {
    if let Some(instance) = watched.upgrade() {
        instance.mark_exited(exit);
        instance.remove_rendezvous();
    }
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let removed = shared.remove_instance(name, id);
    if removed.is_none() {
        debug!(
            target: MANAGER_TARGET,
            plugin = name,
            "exited plugin was no longer registered"
        );
    }
    shared.reporter.exited(name, exit);
}

fn connect_error(
    ctx: &CallContext,
    name: &str,
    plugin_type: PluginType,
    source: TransportError,
) -> PluginError {
    match source {
        TransportError::DeadlineExceeded => PluginError::Timeout {
            name: name.to_owned(),
            phase: Phase::Connect,
            timeout_ms: budget_ms(ctx),
        },
        TransportError::Cancelled => PluginError::Cancelled {
            name: name.to_owned(),
            phase: Phase::Connect,
        },
        source => PluginError::Connect {
            name: name.to_owned(),
            plugin_type,
            source,
        },
    }
}

/// Lowercase hex SHA-256 of the file at `path`.
pub(crate) fn sha256_file(path: &Utf8Path) -> io::Result<String> {
    let mut file = File::open(path.as_std_path())?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    let mut hex = String::with_capacity(64);
    for byte in hasher.finalize() {
        for nibble in [byte >> 4, byte & 0x0f] {
            hex.push(char::from_digit(u32::from(nibble), 16).unwrap_or('0'));
        }
    }
    Ok(hex)
}
