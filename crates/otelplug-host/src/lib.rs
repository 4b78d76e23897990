//! Host side of the plugin subsystem.
//!
//! The host discovers plugin executables under the configured plugin
//! directory, spawns each one with `--ipc <address>`, and talks to it over a
//! multiplexed session whose payloads travel through a per-plugin
//! shared-memory region. [`PluginManager`] is the single registry
//! of running plugins: it performs the `Initialize` handshake, tracks the
//! `Loaded`/`Running` lifecycle, sweeps health, and tears processes down on
//! unload or when the crash watcher sees them exit.
//!
//! [`Loader`] scans the directory tree and aggregates component factories
//! for the pipeline assembler. The command objects in [`commands`] give
//! operator tooling typed access to the same manager through an
//! [`AppContext`].
//!
//! Every blocking call takes a [`CallContext`](otelplug_ipc::CallContext);
//! the manager derives child contexts from the configured per-method
//! timeouts.

mod client;
pub mod commands;
mod daemon;
mod error;
mod events;
mod loader;
mod manager;
mod pool;
mod process;
mod shutdown;
pub mod telemetry;

pub use client::{CallTimeouts, PluginClient};
pub use commands::AppContext;
pub use daemon::{
    ConfigLoader, DaemonError, StaticConfigLoader, SystemConfigLoader, run_daemon,
    run_daemon_with,
};
pub use error::{ErrorKind, Phase, PluginError};
pub use events::{PluginEventReporter, StructuredEventReporter};
pub use loader::{ComponentFactory, Factories, LoadFailure, LoadReport, Loader, RemoteFactory};
pub use manager::{Lifecycle, PluginManager, PluginStatus};
pub use pool::{PooledStream, StreamPool};
pub use process::{ChildProcess, PluginLauncher, PluginProcess, ProcessExit, SystemLauncher};
pub use shutdown::{ShutdownError, ShutdownSignal, SystemShutdownSignal, TERMINATION_SIGNALS};
pub use telemetry::TelemetryError;

#[cfg(test)]
mod tests;
