//! Plugin-side runtime for otelplug plugins.
//!
//! A plugin binary implements [`PluginHandler`] and calls [`run`]. The SDK
//! parses `--ipc <address>`, maps the host's shared-memory region, connects
//! to the rendezvous socket and answers `Initialize`, `Start`, `Stop`, `HealthCheck` and `GetFactory`
//! requests until the host closes the session.
//!
//! ```no_run
//! use otelplug_sdk::{PluginHandler, run};
//! use otelplug_ipc::{FactoryDescriptor, PluginMetadata, PluginType, Stability};
//!
//! struct Batch;
//!
//! impl PluginHandler for Batch {
//!     fn metadata(&self) -> PluginMetadata {
//!         PluginMetadata::new("batch", PluginType::Processor, "0.1.0")
//!     }
//!
//!     fn factory(&self) -> Result<FactoryDescriptor, String> {
//!         Ok(FactoryDescriptor::new("batch", PluginType::Processor, Stability::Beta))
//!     }
//! }
//!
//! fn main() -> std::process::ExitCode {
//!     otelplug_sdk::exit_code(run(Batch))
//! }
//! ```

mod error;
mod handler;
mod runtime;
pub mod server;

pub use error::SdkError;
pub use handler::PluginHandler;
pub use runtime::{LOG_ENV, PluginArgs, exit_code, run, run_with_args};
pub use server::{PluginServer, TRANSITION_IN_PROGRESS};

#[cfg(test)]
mod tests;
