use camino::Utf8PathBuf;
use std::env;

#[cfg(unix)]
use libc::geteuid;

#[cfg(unix)]
use dirs::runtime_dir;

/// Default log filter expression used by the binaries.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default `Initialize` budget; generous to cover cold starts.
pub const DEFAULT_INITIALIZE_TIMEOUT_MS: u64 = 10_000;

/// Default budget for `Start`/`Stop`.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 3_000;

/// Default budget for a single health check.
pub const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 2_000;

/// Default budget for factory retrieval.
pub const DEFAULT_FACTORY_TIMEOUT_MS: u64 = 5_000;

/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;

/// Default number of concurrent streams per plugin session.
pub const DEFAULT_STREAM_POOL_SIZE: usize = 8;

/// Default size of each shared-memory ring, in KiB.
pub const DEFAULT_RING_CAPACITY_KIB: usize = 1_024;

/// Default log filter expression used by the binaries.
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

pub(crate) fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format for the binaries.
pub fn default_log_format() -> crate::logging::LogFormat {
    crate::logging::LogFormat::Json
}

/// Default plugin root, relative to the working directory.
pub fn default_plugin_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("plugins")
}

pub(crate) const fn default_initialize_timeout_ms() -> u64 {
    DEFAULT_INITIALIZE_TIMEOUT_MS
}

pub(crate) const fn default_call_timeout_ms() -> u64 {
    DEFAULT_CALL_TIMEOUT_MS
}

pub(crate) const fn default_health_timeout_ms() -> u64 {
    DEFAULT_HEALTH_TIMEOUT_MS
}

pub(crate) const fn default_factory_timeout_ms() -> u64 {
    DEFAULT_FACTORY_TIMEOUT_MS
}

pub(crate) const fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}

pub(crate) const fn default_stream_pool_size() -> usize {
    DEFAULT_STREAM_POOL_SIZE
}

pub(crate) const fn default_ring_capacity_kib() -> usize {
    DEFAULT_RING_CAPACITY_KIB
}

/// Computes the default directory for plugin rendezvous sockets.
pub fn default_runtime_dir() -> Utf8PathBuf {
    default_runtime_dir_inner()
}

#[cfg(unix)]
fn default_runtime_dir_inner() -> Utf8PathBuf {
    let (mut base, apply_namespace) = match runtime_base_directory() {
        Some(dir) => (dir, false),
        None => (fallback_base_directory(), true),
    };

    base.push("otelplug");
    if apply_namespace {
        base.push(user_namespace());
    }
    base
}

#[cfg(unix)]
fn runtime_base_directory() -> Option<Utf8PathBuf> {
    runtime_dir().and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
}

#[cfg(unix)]
fn fallback_base_directory() -> Utf8PathBuf {
    let candidate = env::temp_dir();
    Utf8PathBuf::from_path_buf(candidate).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
}

#[cfg(unix)]
fn user_namespace() -> String {
    let uid = unsafe { geteuid() };
    format!("uid-{uid}")
}

#[cfg(not(unix))]
fn default_runtime_dir_inner() -> Utf8PathBuf {
    let mut base = Utf8PathBuf::from_path_buf(env::temp_dir())
        .unwrap_or_else(|_| Utf8PathBuf::from("."));
    base.push("otelplug");
    base
}
