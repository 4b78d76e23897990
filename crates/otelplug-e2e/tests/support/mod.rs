//! Temporary plugin trees populated with the stub executable.

use std::fs;
use std::os::unix::fs::symlink;
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use otelplug_config::Config;
use otelplug_e2e::{StubMode, mode_file};
use otelplug_host::PluginManager;
use otelplug_ipc::{CallContext, PluginType};
use tempfile::TempDir;

const STUB: &str = env!("CARGO_BIN_EXE_otelplug-stub-plugin");

/// A plugin directory, a runtime directory and a manager over both.
pub struct PluginTree {
    _dir: TempDir,
    root: Utf8PathBuf,
    manager: PluginManager,
}

impl PluginTree {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 tempdir");
        let manager = PluginManager::new(config(&root));
        Self {
            _dir: dir,
            root,
            manager,
        }
    }

    pub const fn manager(&self) -> &PluginManager {
        &self.manager
    }

    pub fn plugin_dir(&self) -> Utf8PathBuf {
        self.root.join("plugins")
    }

    /// Links the stub in as `<type dir>/<name>` and records its mode.
    pub fn install(&self, plugin_type: PluginType, name: &str, mode: StubMode) -> Utf8PathBuf {
        let dir = self.plugin_dir().join(plugin_type.directory_name());
        fs::create_dir_all(&dir).expect("create plugin type dir");
        let path = dir.join(name);
        symlink(STUB, &path).expect("link stub plugin");
        if mode != StubMode::Serve {
            fs::write(mode_file(path.as_std_path()), mode.to_string()).expect("write mode file");
        }
        path
    }

    /// File names currently present in the runtime directory.
    pub fn runtime_files(&self) -> Vec<String> {
        match fs::read_dir(self.root.join("run")) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Rendezvous sockets currently present.
    pub fn sockets(&self) -> Vec<String> {
        self.runtime_files()
            .into_iter()
            .filter(|name| name.ends_with(".sock"))
            .collect()
    }

    /// Shared-memory regions currently present.
    pub fn regions(&self) -> Vec<String> {
        self.runtime_files()
            .into_iter()
            .filter(|name| name.ends_with(".shm"))
            .collect()
    }
}

impl Drop for PluginTree {
    fn drop(&mut self) {
        let failures = self.manager.shutdown(&ctx());
        assert!(failures.is_empty() || thread::panicking(), "shutdown failures: {failures:?}");
    }
}

fn config(root: &Utf8Path) -> Config {
    Config {
        plugin_dir: root.join("plugins"),
        runtime_dir: root.join("run"),
        initialize_timeout_ms: 3_000,
        call_timeout_ms: 3_000,
        health_timeout_ms: 1_000,
        factory_timeout_ms: 3_000,
        shutdown_grace_ms: 500,
        stream_pool_size: 4,
        ..Config::default()
    }
}

pub fn ctx() -> CallContext {
    CallContext::with_timeout(Duration::from_secs(20))
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

/// Whether `pid` names a live or unreaped process.
pub fn process_exists(pid: u32) -> bool {
    let raw = i32::try_from(pid).expect("pid fits i32");
    kill(Pid::from_raw(raw), None) != Err(Errno::ESRCH)
}
