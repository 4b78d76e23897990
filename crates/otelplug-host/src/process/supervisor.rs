//! Per-instance crash watcher.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::warn;

use super::{PROCESS_TARGET, PluginProcess, ProcessExit};

const WATCH_INTERVAL: Duration = Duration::from_millis(50);

/// Background thread polling one plugin process for unexpected exit.
#[derive(Debug)]
pub(crate) struct Supervisor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Starts watching `process`. `on_exit` runs once, on the watcher
    /// thread, if the process ends before [`Supervisor::stop`].
    pub(crate) fn spawn<E>(
        name: &str,
        process: Arc<dyn PluginProcess>,
        on_exit: E,
    ) -> std::io::Result<Self>
    where
        E: FnOnce(ProcessExit) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let plugin = name.to_owned();
        let handle = thread::Builder::new()
            .name(format!("otelplug-watch-{name}"))
            .spawn(move || watch(&plugin, &flag, process.as_ref(), on_exit))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stops watching and waits for the watcher thread to finish.
    pub(crate) fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!(target: PROCESS_TARGET, "crash watcher panicked");
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn watch<E>(name: &str, stop: &AtomicBool, process: &dyn PluginProcess, on_exit: E)
where
    E: FnOnce(ProcessExit),
{
    while !stop.load(Ordering::SeqCst) {
        match process.try_wait() {
            Ok(Some(exit)) => {
                if !stop.load(Ordering::SeqCst) {
                    on_exit(exit);
                }
                return;
            }
            Ok(None) => {}
            Err(error) => {
                warn!(
                    target: PROCESS_TARGET,
                    plugin = name,
                    error = %error,
                    "failed to poll plugin process"
                );
            }
        }
        thread::sleep(WATCH_INTERVAL);
    }
}
