//! Behaviour-driven tests for plugin lifecycle management.

use std::time::Duration;

use otelplug_ipc::PluginType;
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

use super::support::{Behaviour, Host, ThreadLauncher, ctx, eventually};
use crate::error::PluginError;
use crate::loader::Loader;
use crate::manager::Lifecycle;

// ---------------------------------------------------------------------------
// Test world
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TestWorld {
    launcher: Option<ThreadLauncher>,
    host: Option<Host>,
    outcome: Option<Result<(), PluginError>>,
    factories: Vec<String>,
}

#[fixture]
fn world() -> TestWorld {
    TestWorld::default()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn unquote(text: &str) -> &str {
    text.trim_matches('"')
}

fn host(world: &mut TestWorld) -> &Host {
    if world.host.is_none() {
        let launcher = world.launcher.take().unwrap_or_default();
        world.host = Some(Host::new(launcher));
    }
    world.host.as_ref().expect("host created")
}

fn launcher(world: &mut TestWorld) -> &ThreadLauncher {
    assert!(world.host.is_none(), "configure plugins before the host starts");
    world.launcher.get_or_insert_with(ThreadLauncher::new)
}

fn record<T>(world: &mut TestWorld, outcome: Result<T, PluginError>) {
    world.outcome = Some(outcome.map(|_| ()));
}

// ---------------------------------------------------------------------------
// Given steps
// ---------------------------------------------------------------------------

#[given("a plugin host")]
fn given_host(world: &mut TestWorld) {
    host(world);
}

#[given("plugin {name} never answers")]
fn given_silent(world: &mut TestWorld, name: String) {
    launcher(world).set_behaviour(unquote(&name), Behaviour::Silent);
}

#[given("plugin {name} has no factory")]
fn given_broken_factory(world: &mut TestWorld, name: String) {
    launcher(world).set_behaviour(unquote(&name), Behaviour::BrokenFactory);
}

#[given("{kind} plugin {name} is installed")]
fn given_installed(world: &mut TestWorld, kind: String, name: String) {
    let plugin_type: PluginType = unquote(&kind).parse().expect("plugin type");
    host(world).install(plugin_type, unquote(&name));
}

// ---------------------------------------------------------------------------
// When steps
// ---------------------------------------------------------------------------

#[when("{kind} plugin {name} is loaded")]
fn when_loaded(world: &mut TestWorld, kind: String, name: String) {
    let plugin_type: PluginType = unquote(&kind).parse().expect("plugin type");
    let outcome = host(world).load(plugin_type, unquote(&name));
    record(world, outcome);
}

#[when("the plugin directory is scanned")]
fn when_scanned(world: &mut TestWorld) {
    let host = host(world);
    let outcome = Loader::new(host.manager.clone()).load_plugins(&ctx(), &host.plugin_dir());
    record(world, outcome);
}

#[when("plugin {name} is started")]
fn when_started(world: &mut TestWorld, name: String) {
    let outcome = host(world).manager.start(&ctx(), unquote(&name));
    record(world, outcome);
}

#[when("plugin {name} is stopped")]
fn when_stopped(world: &mut TestWorld, name: String) {
    let outcome = host(world).manager.stop(&ctx(), unquote(&name));
    record(world, outcome);
}

#[when("plugin {name} is unloaded")]
fn when_unloaded(world: &mut TestWorld, name: String) {
    let outcome = host(world).manager.unload(&ctx(), unquote(&name));
    record(world, outcome);
}

#[when("plugin {name} crashes")]
fn when_crashes(world: &mut TestWorld, name: String) {
    host(world)
        .launcher
        .process(unquote(&name))
        .expect("plugin launched")
        .crash();
}

#[when("the factories are collected")]
fn when_factories(world: &mut TestWorld) {
    let host = host(world);
    let factories = Loader::new(host.manager.clone()).get_factories(&ctx());
    let mut keys: Vec<String> = Vec::new();
    for bucket in [
        &factories.receivers,
        &factories.processors,
        &factories.exporters,
        &factories.extensions,
    ] {
        keys.extend(bucket.keys().cloned());
    }
    world.factories = keys;
}

// ---------------------------------------------------------------------------
// Then steps
// ---------------------------------------------------------------------------

#[then("the operation succeeds")]
fn then_succeeds(world: &mut TestWorld) {
    let outcome = world.outcome.as_ref().expect("no outcome recorded");
    assert!(outcome.is_ok(), "unexpected failure: {outcome:?}");
}

#[then("the operation fails with {kind}")]
fn then_fails(world: &mut TestWorld, kind: String) {
    let outcome = world.outcome.as_ref().expect("no outcome recorded");
    match outcome {
        Err(error) => assert_eq!(format!("{:?}", error.kind()), unquote(&kind)),
        Ok(()) => panic!("expected {kind} failure"),
    }
}

#[then("{count} plugins are listed")]
fn then_listed(world: &mut TestWorld, count: String) {
    let expected: usize = unquote(&count).parse().expect("count");
    assert_eq!(host(world).manager.list().len(), expected);
}

#[then("plugin {name} is {state}")]
fn then_lifecycle(world: &mut TestWorld, name: String, state: String) {
    let status = host(world).manager.info(unquote(&name)).expect("plugin loaded");
    let expected = match unquote(&state) {
        "running" => Lifecycle::Running,
        "loaded" => Lifecycle::Loaded,
        other => panic!("unknown lifecycle state {other}"),
    };
    assert_eq!(status.lifecycle, expected);
}

#[then("plugin {name} eventually disappears")]
fn then_disappears(world: &mut TestWorld, name: String) {
    let host = host(world);
    let name = unquote(&name);
    assert!(eventually(Duration::from_secs(3), || host.manager.get(name).is_none()));
    assert!(eventually(Duration::from_secs(1), || host
        .events
        .contains(&format!("exited:{name}"))));
}

#[then("no rendezvous files remain")]
fn then_no_rendezvous_files(world: &mut TestWorld) {
    let host = host(world);
    assert!(eventually(Duration::from_secs(1), || {
        host.sockets().is_empty() && host.regions().is_empty()
    }));
}

#[then("the factories are {keys}")]
fn then_factories(world: &mut TestWorld, keys: String) {
    let expected: Vec<&str> = unquote(&keys).split(", ").collect();
    assert_eq!(world.factories, expected);
}

// ---------------------------------------------------------------------------
// Scenario registration
// ---------------------------------------------------------------------------

#[scenario(path = "tests/features/plugin_lifecycle.feature")]
fn plugin_lifecycle_behaviour(world: TestWorld) {
    let _ = world;
}
