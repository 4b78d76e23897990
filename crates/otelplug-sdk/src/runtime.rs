//! Process entrypoint for plugin binaries.

use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use otelplug_ipc::{IpcAddress, connect};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::error::SdkError;
use crate::handler::PluginHandler;
use crate::server::PluginServer;

const RUNTIME_TARGET: &str = "otelplug_sdk::runtime";

/// Environment variable holding the plugin's log filter.
pub const LOG_ENV: &str = "OTELPLUG_LOG";

/// Command line every plugin binary accepts.
#[derive(Debug, Clone, Parser)]
#[command(about = "otelplug plugin process")]
pub struct PluginArgs {
    /// Rendezvous socket the host is listening on.
    #[arg(long = "ipc", value_name = "ADDRESS")]
    pub ipc: IpcAddress,
}

/// Runs `handler` with the process's command line.
pub fn run<H: PluginHandler>(handler: H) -> Result<(), SdkError> {
    run_with_args(handler, std::env::args_os())
}

/// Runs `handler` with an explicit command line.
pub fn run_with_args<H, I, T>(handler: H, args: I) -> Result<(), SdkError>
where
    H: PluginHandler,
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args = PluginArgs::try_parse_from(args)?;
    install_logging();

    let plugin = handler.metadata();
    info!(
        target: RUNTIME_TARGET,
        plugin = plugin.name(),
        plugin_type = %plugin.plugin_type(),
        address = %args.ipc,
        "connecting to host"
    );
    let session = connect(&args.ipc).map_err(|source| SdkError::Connect {
        address: args.ipc.clone(),
        source,
    })?;
    let server = Arc::new(PluginServer::new(handler));
    server.serve(&session)?;
    info!(target: RUNTIME_TARGET, plugin = plugin.name(), "host closed the session");
    Ok(())
}

/// Maps the outcome of [`run`] to a process exit code, logging failures.
#[must_use]
pub fn exit_code(outcome: Result<(), SdkError>) -> ExitCode {
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(SdkError::Arguments(clap_error)) => {
            let code = clap_error.exit_code();
            if let Err(print_error) = clap_error.print() {
                error!(target: RUNTIME_TARGET, error = %print_error, "failed to print usage");
            }
            u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
        }
        Err(run_error) => {
            error!(target: RUNTIME_TARGET, error = %run_error, "plugin terminated");
            ExitCode::FAILURE
        }
    }
}

fn install_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_target(true)
        .compact()
        .try_init();
    if installed.is_err() {
        info!(target: RUNTIME_TARGET, "tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipc_address() {
        let args = PluginArgs::try_parse_from(["plugin", "--ipc", "/run/otelplug/a.sock"])
            .expect("valid arguments");
        assert_eq!(args.ipc.path().as_str(), "/run/otelplug/a.sock");
    }

    #[test]
    fn missing_ipc_address_is_an_error() {
        assert!(PluginArgs::try_parse_from(["plugin"]).is_err());
    }
}
