//! Malformed configuration must be reported, never silently defaulted.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;
use ortho_config::OrthoConfig;
use tempfile::TempDir;

use otelplug_config::Config;

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

struct EnvOverride {
    key: &'static str,
    previous: Option<OsString>,
    guard: Option<MutexGuard<'static, ()>>,
}

impl EnvOverride {
    fn set_var(key: &'static str, value: &OsStr) -> Self {
        let guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        let previous = std::env::var_os(key);
        unsafe { std::env::set_var(key, value) };
        Self {
            key,
            previous,
            guard: Some(guard),
        }
    }
}

impl Drop for EnvOverride {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(value) => unsafe { std::env::set_var(self.key, value) },
            None => unsafe { std::env::remove_var(self.key) },
        }
        drop(self.guard.take());
    }
}

#[test]
fn malformed_config_file_is_rejected() {
    let temp_dir = TempDir::new().expect("create temp dir");
    let path = temp_dir.path().join("otelplug.toml");
    fs::write(&path, "call_timeout_ms = \"soon\"\n").expect("write malformed config");

    let args = vec![
        OsString::from("otelplugd"),
        OsString::from("--config-path"),
        path.into_os_string(),
    ];

    let error = Config::load_from_iter(args).expect_err("loading must fail");
    assert!(!error.to_string().is_empty());
}

#[test]
fn unknown_log_format_from_environment_is_rejected() {
    let _env = EnvOverride::set_var("OTELPLUG_LOG_FORMAT", OsStr::new("xml"));

    let error = Config::load_from_iter([OsString::from("otelplugd")])
        .expect_err("unknown log format must fail");
    assert!(!error.to_string().is_empty());
}

#[test]
fn config_path_from_environment_is_honoured() {
    let temp_dir = TempDir::new().expect("create temp dir");
    let path = temp_dir.path().join("otelplug.toml");
    fs::write(&path, "health_timeout_ms = 750\n").expect("write config");
    let _env = EnvOverride::set_var("OTELPLUG_CONFIG_PATH", path.as_os_str());

    let config = Config::load_from_iter([OsString::from("otelplugd")]).expect("config loads");
    assert_eq!(config.health_timeout_ms, 750);
}
