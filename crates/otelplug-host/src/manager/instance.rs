//! One loaded plugin and the resources it owns.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use camino::Utf8PathBuf;
use otelplug_ipc::{
    IpcAddress, PluginHealth, PluginMetadata, Session, remove_region_file, remove_socket_file,
};
use serde::Serialize;
use tracing::{debug, warn};

use super::MANAGER_TARGET;
use crate::client::PluginClient;
use crate::error::PluginError;
use crate::process::{PluginProcess, ProcessExit, Supervisor};

/// Host-side lifecycle of a loaded plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Handshake complete, not processing.
    Loaded,
    /// `Start` succeeded.
    Running,
}

/// Snapshot of a loaded plugin for operator tooling.
#[derive(Debug, Clone, Serialize)]
pub struct PluginStatus {
    /// Metadata confirmed during the handshake.
    pub metadata: PluginMetadata,
    /// Binary the process was spawned from.
    pub binary: Utf8PathBuf,
    /// Rendezvous socket path.
    pub socket: Utf8PathBuf,
    /// Shared-memory region carrying the plugin's payloads.
    pub region: Utf8PathBuf,
    /// Process id, when the launcher reports one.
    pub pid: Option<u32>,
    /// Host-side lifecycle state.
    pub lifecycle: Lifecycle,
    /// Last observed health.
    pub health: PluginHealth,
    /// When the handshake completed.
    pub loaded_at: SystemTime,
}

#[derive(Debug)]
struct InstanceState {
    lifecycle: Lifecycle,
    health: PluginHealth,
}

/// Exclusive owner of one plugin's process, session, rendezvous socket,
/// shared-memory region and crash watcher.
#[derive(Debug)]
pub(crate) struct PluginInstance {
    id: u64,
    metadata: PluginMetadata,
    binary: Utf8PathBuf,
    address: IpcAddress,
    client: PluginClient,
    process: Arc<dyn PluginProcess>,
    state: Mutex<InstanceState>,
    loaded_at: SystemTime,
    supervisor: Mutex<Option<Supervisor>>,
}

impl PluginInstance {
    pub(crate) fn new(
        id: u64,
        metadata: PluginMetadata,
        binary: Utf8PathBuf,
        address: IpcAddress,
        client: PluginClient,
        process: Arc<dyn PluginProcess>,
    ) -> Self {
        Self {
            id,
            metadata,
            binary,
            address,
            client,
            process,
            state: Mutex::new(InstanceState {
                lifecycle: Lifecycle::Loaded,
                health: PluginHealth::unknown(),
            }),
            loaded_at: SystemTime::now(),
            supervisor: Mutex::new(None),
        }
    }

    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    pub(crate) const fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    pub(crate) fn name(&self) -> &str {
        self.metadata.name()
    }

    pub(crate) const fn client(&self) -> &PluginClient {
        &self.client
    }

    pub(crate) fn process(&self) -> Arc<dyn PluginProcess> {
        Arc::clone(&self.process)
    }

    pub(crate) fn status(&self) -> PluginStatus {
        let state = self.state();
        PluginStatus {
            metadata: self.metadata.clone(),
            binary: self.binary.clone(),
            socket: self.address.path().to_path_buf(),
            region: self.address.region_path(),
            pid: self.process.id(),
            lifecycle: state.lifecycle,
            health: state.health.clone(),
            loaded_at: self.loaded_at,
        }
    }

    pub(crate) fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.state().lifecycle = lifecycle;
    }

    pub(crate) fn record_health(&self, health: PluginHealth) {
        self.state().health = health;
    }

    pub(crate) fn attach_supervisor(&self, supervisor: Supervisor) {
        *self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(supervisor);
    }

    /// Stops the crash watcher and waits for it to finish.
    pub(crate) fn stop_supervisor(&self) {
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut supervisor) = supervisor {
            supervisor.stop();
        }
    }

    /// Records an unexpected exit and aborts outstanding calls.
    pub(crate) fn mark_exited(&self, exit: ProcessExit) {
        self.record_health(PluginHealth::failed(
            "plugin process exited",
            exit.to_string(),
        ));
        self.client.close();
    }

    /// Closes the session, terminates the process and removes the
    /// rendezvous files. Failures after the process is reaped are logged.
    pub(crate) fn shut_down(&self, grace: Duration) -> Result<ProcessExit, PluginError> {
        self.stop_supervisor();
        self.client.close();
        let exit = self
            .process
            .terminate(grace)
            .map_err(|source| PluginError::Terminate {
                name: self.name().to_owned(),
                source: Arc::new(source),
            });
        self.remove_rendezvous();
        exit
    }

    /// Removes the socket and the shared-memory region. Mappings held by
    /// either side stay valid until dropped.
    pub(crate) fn remove_rendezvous(&self) {
        remove_rendezvous_files(self.name(), &self.address);
    }

    fn state(&self) -> MutexGuard<'_, InstanceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        self.client.close();
        if matches!(self.process.try_wait(), Ok(None)) {
            if let Err(error) = self.process.kill() {
                warn!(
                    target: MANAGER_TARGET,
                    plugin = self.metadata.name(),
                    error = %error,
                    "failed to kill plugin process on drop"
                );
            }
            self.remove_rendezvous();
        }
    }
}

/// Resources acquired by an in-flight load; released on drop unless the
/// load succeeds.
pub(crate) struct LoadAttempt<'a> {
    name: &'a str,
    address: &'a IpcAddress,
    socket_bound: bool,
    process: Option<Arc<dyn PluginProcess>>,
    session: Option<Arc<Session>>,
    armed: bool,
}

impl<'a> LoadAttempt<'a> {
    pub(crate) const fn new(name: &'a str, address: &'a IpcAddress) -> Self {
        Self {
            name,
            address,
            socket_bound: false,
            process: None,
            session: None,
            armed: true,
        }
    }

    /// Marks the rendezvous socket as ours to remove.
    pub(crate) const fn track_socket(&mut self) {
        self.socket_bound = true;
    }

    pub(crate) fn track_process(&mut self, process: Arc<dyn PluginProcess>) {
        self.process = Some(process);
    }

    pub(crate) fn track_session(&mut self, session: Arc<Session>) {
        self.session = Some(session);
    }

    /// Hands the tracked resources over to a registered instance.
    pub(crate) fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for LoadAttempt<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(session) = self.session.take() {
            session.close();
        }
        if let Some(process) = self.process.take() {
            match process.kill() {
                Ok(exit) => debug!(
                    target: MANAGER_TARGET,
                    plugin = self.name,
                    %exit,
                    "failed load: plugin process reaped"
                ),
                Err(error) => warn!(
                    target: MANAGER_TARGET,
                    plugin = self.name,
                    error = %error,
                    "failed load: could not kill plugin process"
                ),
            }
        }
        if self.socket_bound {
            remove_rendezvous_files(self.name, self.address);
        } else if let Err(error) = remove_region_file(&self.address.region_path()) {
            warn!(
                target: MANAGER_TARGET,
                plugin = self.name,
                error = %error,
                "failed load: could not remove shared-memory region"
            );
        }
    }
}

fn remove_rendezvous_files(plugin: &str, address: &IpcAddress) {
    let region = address.region_path();
    let outcomes = [
        ("socket", remove_socket_file(address.path())),
        ("region", remove_region_file(&region)),
    ];
    for (file, outcome) in outcomes {
        match outcome {
            Ok(removed) => debug!(
                target: MANAGER_TARGET,
                plugin,
                file,
                removed,
                "rendezvous file cleared"
            ),
            Err(error) => warn!(
                target: MANAGER_TARGET,
                plugin,
                file,
                error = %error,
                "failed to remove rendezvous file"
            ),
        }
    }
}
