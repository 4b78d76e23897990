use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::{fs, process, thread};

use clap::Parser;
use otelplug_ipc::{
    FactoryDescriptor, PluginMetadata, PluginType, PluginTypeParseError, Stability, connect,
};
use otelplug_sdk::{PluginArgs, PluginHandler, SdkError, run_with_args};
use strum::{Display, EnumString};
use thiserror::Error;

/// Version every stub reports in its handshake.
pub const STUB_VERSION: &str = "0.1.0";

/// Exit status used by [`StubMode::CrashOnStart`].
const CRASH_STATUS: i32 = 3;

/// How a stub behaves once launched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum StubMode {
    /// Answers every request.
    #[default]
    Serve,
    /// Connects to the host and never answers.
    Silent,
    /// Exits before connecting.
    ExitImmediately,
    /// Fails `GetFactory`.
    BrokenFactory,
    /// Exits from inside the `Start` handler.
    CrashOnStart,
}

/// Errors that stop the stub before it can serve.
#[derive(Debug, Error)]
pub enum StubError {
    /// The process was started without an `argv[0]`.
    #[error("missing program name")]
    MissingProgram,
    /// `argv[0]` has no usable file name.
    #[error("cannot derive a plugin name from '{0}'")]
    NoName(PathBuf),
    /// The parent directory does not name a plugin type.
    #[error("cannot derive a plugin type from '{path}': {source}")]
    NoType {
        /// Program path.
        path: PathBuf,
        /// Parse failure for the directory name.
        #[source]
        source: PluginTypeParseError,
    },
    /// The mode file exists but could not be read.
    #[error("failed to read mode file '{path}': {source}")]
    ModeFile {
        /// Mode file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The mode file names no known mode.
    #[error("unknown stub mode '{0}'")]
    UnknownMode(String),
    /// The SDK runtime failed.
    #[error(transparent)]
    Sdk(#[from] SdkError),
}

/// Name and type a stub claims, taken from its program path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubIdentity {
    name: String,
    plugin_type: PluginType,
}

impl StubIdentity {
    /// Derives the identity from `<.../type dir>/<name>`.
    pub fn from_program(program: &Path) -> Result<Self, StubError> {
        let name = program
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| StubError::NoName(program.to_path_buf()))?;
        let directory = program
            .parent()
            .and_then(Path::file_name)
            .and_then(|dir| dir.to_str())
            .unwrap_or_default();
        let plugin_type = directory.parse().map_err(|source| StubError::NoType {
            path: program.to_path_buf(),
            source,
        })?;
        Ok(Self {
            name: name.to_owned(),
            plugin_type,
        })
    }

    /// Plugin name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Plugin type.
    #[must_use]
    pub const fn plugin_type(&self) -> PluginType {
        self.plugin_type
    }
}

/// Location of the mode file for the stub installed at `program`.
#[must_use]
pub fn mode_file(program: &Path) -> PathBuf {
    let name = program
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    program.with_file_name(format!(".{name}.mode"))
}

fn read_mode(program: &Path) -> Result<StubMode, StubError> {
    let path = mode_file(program);
    match fs::read_to_string(&path) {
        Ok(text) => {
            let text = text.trim();
            text.parse()
                .map_err(|_| StubError::UnknownMode(text.to_owned()))
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(StubMode::Serve),
        Err(source) => Err(StubError::ModeFile { path, source }),
    }
}

/// Plugin handler backing the stub executable.
#[derive(Debug, Clone)]
pub struct StubPlugin {
    identity: StubIdentity,
    mode: StubMode,
}

impl StubPlugin {
    /// Creates a handler for `identity` behaving as `mode`.
    #[must_use]
    pub const fn new(identity: StubIdentity, mode: StubMode) -> Self {
        Self { identity, mode }
    }
}

impl PluginHandler for StubPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(
            self.identity.name(),
            self.identity.plugin_type(),
            STUB_VERSION,
        )
        .with_description("otelplug end-to-end stub")
        .with_capabilities(["logs", "metrics", "traces"])
    }

    fn factory(&self) -> Result<FactoryDescriptor, String> {
        if self.mode == StubMode::BrokenFactory {
            return Err("factory unavailable".to_owned());
        }
        Ok(FactoryDescriptor::new(
            self.identity.name(),
            self.identity.plugin_type(),
            Stability::Development,
        )
        .with_default_config(serde_json::json!({ "stub": self.identity.name() })))
    }

    fn on_start(&self) -> Result<(), String> {
        if self.mode == StubMode::CrashOnStart {
            process::exit(CRASH_STATUS);
        }
        Ok(())
    }
}

/// Runs the stub with an explicit command line.
///
/// Returns only when the host closes the session or start-up fails. In
/// [`StubMode::Silent`] it holds the connection until killed.
pub fn run_stub<I, T>(args: I) -> Result<(), StubError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    let program = PathBuf::from(args.first().ok_or(StubError::MissingProgram)?);
    let identity = StubIdentity::from_program(&program)?;
    match read_mode(&program)? {
        StubMode::ExitImmediately => Ok(()),
        StubMode::Silent => hold_silently(&args),
        mode => run_with_args(StubPlugin::new(identity, mode), args).map_err(StubError::from),
    }
}

fn hold_silently(args: &[OsString]) -> Result<(), StubError> {
    let parsed = PluginArgs::try_parse_from(args).map_err(SdkError::from)?;
    let _session = connect(&parsed.ipc).map_err(|source| SdkError::Connect {
        address: parsed.ipc.clone(),
        source,
    })?;
    loop {
        thread::park();
    }
}
