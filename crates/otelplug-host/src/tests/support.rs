//! In-process plugin doubles for host tests.
//!
//! [`ThreadLauncher`] runs each "plugin" on a thread that connects to the
//! rendezvous address and serves requests with the SDK server, so manager
//! tests exercise the real transport without building binaries.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use otelplug_config::Config;
use otelplug_ipc::{
    CallContext, FactoryDescriptor, IpcAddress, PluginHealth, PluginMetadata, PluginType, Session,
    Stability,
    connect,
};
use otelplug_sdk::{PluginHandler, PluginServer};
use serde_json::json;
use tempfile::TempDir;

use crate::client::PluginClient;
use crate::error::PluginError;
use crate::events::PluginEventReporter;
use crate::manager::PluginManager;
use crate::process::{PluginLauncher, PluginProcess, ProcessExit};

// ---------------------------------------------------------------------------
// Plugin behaviour
// ---------------------------------------------------------------------------

/// How a test plugin reacts once launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Behaviour {
    /// Serves every request normally.
    #[default]
    Serve,
    /// Connects but never answers.
    Silent,
    /// Exits before connecting.
    ExitImmediately,
    /// Serves, but `GetFactory` fails.
    BrokenFactory,
    /// Serves, but `Start` fails.
    FailStart,
    /// Serves, but health checks take longer than any test budget.
    SlowHealth,
    /// Completes the handshake and reports itself exited straight away.
    ExitAfterHandshake,
    /// Serves a factory descriptor for a receiver whatever its own type.
    MismatchedFactory,
}

struct TestPlugin {
    metadata: PluginMetadata,
    behaviour: Behaviour,
    exit: Arc<Mutex<Option<ProcessExit>>>,
}

impl PluginHandler for TestPlugin {
    fn metadata(&self) -> PluginMetadata {
        self.metadata.clone()
    }

    fn accept(&self, _declared: &PluginMetadata) -> Result<(), String> {
        if self.behaviour == Behaviour::ExitAfterHandshake {
            self.exit
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_or_insert(ProcessExit::Code(4));
        }
        Ok(())
    }

    fn factory(&self) -> Result<FactoryDescriptor, String> {
        if self.behaviour == Behaviour::BrokenFactory {
            return Err("factory unavailable".to_owned());
        }
        let described = if self.behaviour == Behaviour::MismatchedFactory {
            PluginType::Receiver
        } else {
            self.metadata.plugin_type()
        };
        Ok(FactoryDescriptor::new(
            format!("{}_component", self.metadata.name()),
            described,
            Stability::Beta,
        )
        .with_default_config(json!({ "endpoint": "localhost:4317" })))
    }

    fn on_start(&self) -> Result<(), String> {
        if self.behaviour == Behaviour::FailStart {
            return Err("start refused".to_owned());
        }
        Ok(())
    }

    fn observe_health(&self) -> Option<PluginHealth> {
        if self.behaviour == Behaviour::SlowHealth {
            thread::sleep(Duration::from_millis(1_500));
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Thread-backed process
// ---------------------------------------------------------------------------

/// A plugin "process" running on a thread.
#[derive(Debug)]
pub(crate) struct ThreadProcess {
    pid: u32,
    exit: Arc<Mutex<Option<ProcessExit>>>,
    session: Arc<Mutex<Option<Arc<Session>>>>,
    stopping: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    terminations: AtomicU32,
}

impl ThreadProcess {
    /// Simulates the plugin dying on its own.
    pub(crate) fn crash(&self) {
        self.finish(ProcessExit::Code(101));
    }

    /// Times `terminate` or `kill` was called.
    pub(crate) fn terminations(&self) -> u32 {
        self.terminations.load(Ordering::SeqCst)
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.exit.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    fn finish(&self, exit: ProcessExit) -> ProcessExit {
        self.stopping.store(true, Ordering::SeqCst);
        let recorded = *self
            .exit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(exit);
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.close();
        }
        recorded
    }

    fn reap(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker
            && worker.thread().id() != thread::current().id()
        {
            worker.join().expect("plugin thread panicked");
        }
    }
}

impl PluginProcess for Arc<ThreadProcess> {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_wait(&self) -> io::Result<Option<ProcessExit>> {
        Ok(*self.exit.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn terminate(&self, _grace: Duration) -> io::Result<ProcessExit> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        let exit = self.finish(ProcessExit::Signal(15));
        self.reap();
        Ok(exit)
    }

    fn kill(&self) -> io::Result<ProcessExit> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        let exit = self.finish(ProcessExit::Signal(9));
        self.reap();
        Ok(exit)
    }
}

fn run_plugin(
    address: &IpcAddress,
    handler: TestPlugin,
    exit: &Mutex<Option<ProcessExit>>,
    slot: &Mutex<Option<Arc<Session>>>,
    stopping: &AtomicBool,
) {
    if handler.behaviour == Behaviour::ExitImmediately {
        exit.lock().unwrap_or_else(PoisonError::into_inner).get_or_insert(ProcessExit::Code(3));
        return;
    }
    let Ok(session) = connect(address) else {
        exit.lock().unwrap_or_else(PoisonError::into_inner).get_or_insert(ProcessExit::Code(2));
        return;
    };
    let session = Arc::new(session);
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&session));
    if stopping.load(Ordering::SeqCst) {
        session.close();
    }

    if handler.behaviour == Behaviour::Silent {
        while !stopping.load(Ordering::SeqCst) && !session.is_closed() {
            thread::sleep(Duration::from_millis(5));
        }
    } else {
        let server = Arc::new(PluginServer::new(handler));
        server.serve(&session).expect("serve");
    }
    exit.lock().unwrap_or_else(PoisonError::into_inner).get_or_insert(ProcessExit::Code(0));
}

// ---------------------------------------------------------------------------
// Launcher
// ---------------------------------------------------------------------------

/// Launches [`ThreadProcess`]es; the plugin name is the binary's file name
/// and the type comes from its parent directory.
#[derive(Debug, Default)]
pub(crate) struct ThreadLauncher {
    behaviours: Mutex<HashMap<String, Behaviour>>,
    versions: Mutex<HashMap<String, String>>,
    launched: Mutex<Vec<(String, Arc<ThreadProcess>)>>,
    next_pid: AtomicU32,
}

impl ThreadLauncher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_behaviour(self, name: &str, behaviour: Behaviour) -> Self {
        self.set_behaviour(name, behaviour);
        self
    }

    pub(crate) fn set_behaviour(&self, name: &str, behaviour: Behaviour) {
        self.behaviours
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), behaviour);
    }

    /// Makes `name` report `version` as its own.
    pub(crate) fn with_version(self, name: &str, version: &str) -> Self {
        self.versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), version.to_owned());
        self
    }

    /// Number of processes launched so far.
    pub(crate) fn launch_count(&self) -> usize {
        self.launched.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Most recent process launched for `name`.
    pub(crate) fn process(&self, name: &str) -> Option<Arc<ThreadProcess>> {
        self.launched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|(launched, _)| launched == name)
            .map(|(_, process)| Arc::clone(process))
    }

    fn metadata_for(&self, binary: &Utf8Path) -> PluginMetadata {
        let name = binary.file_name().unwrap_or("plugin").to_owned();
        let plugin_type = binary
            .parent()
            .and_then(Utf8Path::file_name)
            .and_then(|dir| dir.parse::<PluginType>().ok())
            .unwrap_or(PluginType::Receiver);
        let version = self
            .versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .cloned()
            .unwrap_or_else(|| "1.0.0".to_owned());
        PluginMetadata::new(name, plugin_type, version)
            .with_description("test plugin")
            .with_capability("traces")
    }
}

impl PluginLauncher for ThreadLauncher {
    fn launch(
        &self,
        binary: &Utf8Path,
        address: &IpcAddress,
    ) -> io::Result<Box<dyn PluginProcess>> {
        let metadata = self.metadata_for(binary);
        let name = metadata.name().to_owned();
        let behaviour = self
            .behaviours
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .copied()
            .unwrap_or_default();
        let exit = Arc::new(Mutex::new(None));
        let slot = Arc::new(Mutex::new(None));
        let stopping = Arc::new(AtomicBool::new(false));
        let handler = TestPlugin {
            metadata,
            behaviour,
            exit: Arc::clone(&exit),
        };
        let worker = {
            let address = address.clone();
            let exit = Arc::clone(&exit);
            let slot = Arc::clone(&slot);
            let stopping = Arc::clone(&stopping);
            thread::Builder::new()
                .name(format!("test-plugin-{name}"))
                .spawn(move || run_plugin(&address, handler, &exit, &slot, &stopping))?
        };
        let process = Arc::new(ThreadProcess {
            pid: 40_000 + self.next_pid.fetch_add(1, Ordering::SeqCst),
            exit,
            session: slot,
            stopping,
            worker: Mutex::new(Some(worker)),
            terminations: AtomicU32::new(0),
        });
        self.launched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name, Arc::clone(&process)));
        Ok(Box::new(process))
    }
}

// ---------------------------------------------------------------------------
// Event recording
// ---------------------------------------------------------------------------

/// Records lifecycle events as `"<event>:<plugin>"` strings.
#[derive(Debug, Default)]
pub(crate) struct RecordingReporter {
    events: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn contains(&self, event: &str) -> bool {
        self.events().iter().any(|recorded| recorded == event)
    }

    fn record(&self, event: &str, plugin: &str) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{event}:{plugin}"));
    }
}

impl PluginEventReporter for RecordingReporter {
    fn loading(&self, _plugin_type: PluginType, name: &str, _binary: &Utf8Path) {
        self.record("loading", name);
    }

    fn loaded(&self, metadata: &PluginMetadata, _pid: Option<u32>) {
        self.record("loaded", metadata.name());
    }

    fn load_failed(&self, error: &PluginError) {
        self.record("load_failed", error.plugin_name().unwrap_or("?"));
    }

    fn unloaded(&self, name: &str, _exit: Option<ProcessExit>) {
        self.record("unloaded", name);
    }

    fn exited(&self, name: &str, _exit: ProcessExit) {
        self.record("exited", name);
    }
}

// ---------------------------------------------------------------------------
// Host fixture
// ---------------------------------------------------------------------------

/// A manager over a temporary plugin tree and thread-backed plugins.
pub(crate) struct Host {
    _dir: TempDir,
    pub(crate) root: Utf8PathBuf,
    pub(crate) launcher: Arc<ThreadLauncher>,
    pub(crate) events: Arc<RecordingReporter>,
    pub(crate) manager: PluginManager,
}

impl Host {
    pub(crate) fn new(launcher: ThreadLauncher) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 temp dir");
        let launcher = Arc::new(launcher);
        let events = Arc::new(RecordingReporter::default());
        let manager = PluginManager::with_parts(
            test_config(&root),
            Arc::clone(&launcher) as Arc<dyn PluginLauncher>,
            Arc::clone(&events) as Arc<dyn PluginEventReporter>,
        );
        Self {
            _dir: dir,
            root,
            launcher,
            events,
            manager,
        }
    }

    pub(crate) fn plugin_dir(&self) -> Utf8PathBuf {
        self.root.join("plugins")
    }

    pub(crate) fn runtime_dir(&self) -> Utf8PathBuf {
        self.root.join("run")
    }

    /// Writes a placeholder binary for `name` and returns its path.
    pub(crate) fn install(&self, plugin_type: PluginType, name: &str) -> Utf8PathBuf {
        let dir = self.plugin_dir().join(plugin_type.directory_name());
        fs::create_dir_all(&dir).expect("plugin type dir");
        let path = dir.join(name);
        fs::write(&path, format!("#!{name}\n")).expect("write plugin binary");
        path
    }

    pub(crate) fn load(&self, plugin_type: PluginType, name: &str) -> Result<PluginClient, PluginError> {
        self.install(plugin_type, name);
        self.manager.load(&ctx(), plugin_type, name)
    }

    /// Rendezvous sockets currently present.
    pub(crate) fn sockets(&self) -> Vec<String> {
        self.runtime_files(".sock")
    }

    /// Shared-memory regions currently present.
    pub(crate) fn regions(&self) -> Vec<String> {
        self.runtime_files(".shm")
    }

    fn runtime_files(&self, suffix: &str) -> Vec<String> {
        match fs::read_dir(self.runtime_dir()) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .filter(|name| name.ends_with(suffix))
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        let failures = self.manager.shutdown(&ctx());
        assert!(failures.is_empty() || thread::panicking(), "shutdown failures: {failures:?}");
    }
}

/// Configuration with short timeouts rooted at `root`.
pub(crate) fn test_config(root: &Utf8Path) -> Config {
    Config {
        plugin_dir: root.join("plugins"),
        runtime_dir: root.join("run"),
        initialize_timeout_ms: 1_000,
        call_timeout_ms: 2_000,
        health_timeout_ms: 500,
        factory_timeout_ms: 2_000,
        shutdown_grace_ms: 200,
        stream_pool_size: 4,
        ring_capacity_kib: 64,
        ..Config::default()
    }
}

pub(crate) fn ctx() -> CallContext {
    CallContext::with_timeout(Duration::from_secs(10))
}

/// Polls `condition` until it holds or `timeout` passes.
pub(crate) fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
