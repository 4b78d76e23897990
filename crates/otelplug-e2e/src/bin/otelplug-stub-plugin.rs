//! Stub plugin executable used by the end-to-end tests.

use std::io::{self, Write};
use std::process::ExitCode;

use otelplug_e2e::{StubError, run_stub};

fn main() -> ExitCode {
    match run_stub(std::env::args_os()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(StubError::Sdk(error)) => otelplug_sdk::exit_code(Err(error)),
        Err(error) => {
            // Logging is not installed until the SDK runtime starts.
            if writeln!(io::stderr(), "otelplug-stub-plugin: {error}").is_err() {
                return ExitCode::from(2);
            }
            ExitCode::FAILURE
        }
    }
}
