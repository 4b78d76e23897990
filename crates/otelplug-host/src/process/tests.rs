//! Unit tests for process termination and crash supervision.

use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rstest::rstest;

use super::*;

fn spawn(script: &str) -> ChildProcess {
    let child = Command::new("sh")
        .arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .spawn()
        .expect("spawn shell");
    ChildProcess::new(child)
}

#[rstest]
#[case::code(ProcessExit::Code(3), "exit status 3")]
#[case::signal(ProcessExit::Signal(9), "terminated by signal 9")]
#[case::unknown(ProcessExit::Unknown, "exited")]
fn exit_descriptions(#[case] exit: ProcessExit, #[case] expected: &str) {
    assert_eq!(exit.to_string(), expected);
}

#[test]
fn terminate_stops_a_cooperative_process_with_sigterm() {
    let process = spawn("exec sleep 30");
    assert_eq!(process.try_wait().expect("poll"), None);

    let exit = process
        .terminate(Duration::from_secs(5))
        .expect("terminate");

    assert_eq!(exit, ProcessExit::Signal(15));
    assert_eq!(process.try_wait().expect("poll"), Some(exit));
}

#[test]
fn terminate_escalates_when_sigterm_is_ignored() {
    let process = spawn("trap '' TERM; while :; do sleep 1; done");
    // Give the shell a moment to install its trap.
    std::thread::sleep(Duration::from_millis(200));

    let exit = process
        .terminate(Duration::from_millis(200))
        .expect("terminate");

    assert_eq!(exit, ProcessExit::Signal(9));
}

#[test]
fn exited_process_reports_its_status_and_tolerates_kill() {
    let process = spawn("exit 7");
    let mut exit = None;
    for _ in 0..200 {
        exit = process.try_wait().expect("poll");
        if exit.is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(exit, Some(ProcessExit::Code(7)));
    assert_eq!(process.kill().expect("kill"), ProcessExit::Code(7));
    assert_eq!(process.terminate(Duration::ZERO).expect("terminate"), ProcessExit::Code(7));
}

#[test]
fn system_launcher_passes_the_ipc_address() {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let root = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8");
    let script = root.join("plugin.sh");
    let record = root.join("args");
    std::fs::write(&script, format!("#!/bin/sh\necho \"$@\" > {record}\n")).expect("write script");
    let mut permissions = std::fs::metadata(&script).expect("stat").permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut permissions, 0o755);
    std::fs::set_permissions(&script, permissions).expect("chmod");

    let address = IpcAddress::from(root.join("plugin.sock"));
    let process = SystemLauncher.launch(&script, &address).expect("launch");
    let exit = process.terminate(Duration::from_secs(5)).expect("reap");
    assert!(matches!(exit, ProcessExit::Code(0) | ProcessExit::Signal(15)));

    if exit == ProcessExit::Code(0) {
        let args = std::fs::read_to_string(&record).expect("args recorded");
        assert_eq!(args.trim(), format!("--ipc {address}"));
    }
}

/// Process double whose exit is controlled by the test.
#[derive(Debug, Default)]
struct ScriptedProcess {
    exit: Mutex<Option<ProcessExit>>,
}

impl PluginProcess for ScriptedProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn try_wait(&self) -> io::Result<Option<ProcessExit>> {
        Ok(*self.exit.lock().expect("exit lock"))
    }

    fn terminate(&self, _grace: Duration) -> io::Result<ProcessExit> {
        self.kill()
    }

    fn kill(&self) -> io::Result<ProcessExit> {
        Ok(*self
            .exit
            .lock()
            .expect("exit lock")
            .get_or_insert(ProcessExit::Signal(9)))
    }
}

#[test]
fn supervisor_reports_an_unexpected_exit_once() {
    let process = Arc::new(ScriptedProcess::default());
    let (sender, receiver) = mpsc::channel();
    let _supervisor = Supervisor::spawn("watched", Arc::clone(&process) as Arc<dyn PluginProcess>, move |exit| {
        sender.send(exit).expect("report exit");
    })
    .expect("spawn supervisor");

    *process.exit.lock().expect("exit lock") = Some(ProcessExit::Code(1));

    let reported = receiver
        .recv_timeout(Duration::from_secs(2))
        .expect("exit reported");
    assert_eq!(reported, ProcessExit::Code(1));
    assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn stopped_supervisor_stays_silent() {
    let process = Arc::new(ScriptedProcess::default());
    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    let mut supervisor = Supervisor::spawn("watched", Arc::clone(&process) as Arc<dyn PluginProcess>, move |_| {
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
    })
    .expect("spawn supervisor");

    supervisor.stop();
    *process.exit.lock().expect("exit lock") = Some(ProcessExit::Code(0));
    std::thread::sleep(Duration::from_millis(150));

    assert!(!fired.load(std::sync::atomic::Ordering::SeqCst));
}
