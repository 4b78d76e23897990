//! `otelplugd`: runs the plugin host until a termination signal arrives.

use std::process::ExitCode;

use otelplug_config::Config;
use otelplug_host::telemetry;

fn main() -> ExitCode {
    match otelplug_host::run_daemon() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            // Configuration failures happen before telemetry exists.
            if telemetry::install(&Config::default()).is_ok() {
                tracing::error!(target: "otelplug_host::daemon", error = %error, "plugin host failed");
            }
            ExitCode::FAILURE
        }
    }
}
