//! End-to-end support for the otelplug host.
//!
//! The crate builds `otelplug-stub-plugin`, a real plugin executable driven
//! by the SDK. Tests link it into a temporary plugin tree under whatever
//! name and type they need; the stub derives its identity from the path it
//! was started through:
//!
//! ```text
//! <plugin_dir>/receivers/otlp          -> receiver "otlp"
//! <plugin_dir>/receivers/.otlp.mode    -> optional behaviour, e.g. "silent"
//! ```
//!
//! Dot-files are skipped by plugin discovery, so the mode file never shows
//! up as a plugin of its own.

mod stub;

pub use stub::{STUB_VERSION, StubError, StubIdentity, StubMode, StubPlugin, mode_file, run_stub};
