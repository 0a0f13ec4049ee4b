// Orchestrator lifecycle against a fake container engine and real port probes

mod common;

use berth::config::{Config, ConflictPolicy};
use berth::errors::BerthError;
use berth::orchestrator::phase::Phase;
use berth::orchestrator::session::SessionRecord;
use berth::orchestrator::ContainerOrchestrator;
use berth::ports::PortAssignmentRegistry;
use common::{fail, free_block, occupy, ok, FakeRunner};
use serial_test::serial;
use std::sync::Arc;
use tempfile::TempDir;

fn config(temp_dir: &TempDir, base: u16) -> Config {
    let mut config = Config::default();
    config.ports.host = "127.0.0.1".to_string();
    config.ports.preferred_base = base;
    config.containers.state_dir = temp_dir.path().join(".berth");
    config.containers.health_timeout_secs = 0;
    config.tests.command = vec!["npm".to_string(), "run".to_string(), "e2e".to_string()];
    config
}

#[test]
#[serial]
fn test_full_cycle_on_free_block() {
    let temp_dir = TempDir::new().unwrap();
    let base = free_block(3);
    let runner = Arc::new(FakeRunner::healthy_podman().on("npm", ok("all green")));
    let registry = Arc::new(
        PortAssignmentRegistry::open(&temp_dir.path().join("ports.json"), 4000).unwrap(),
    );
    registry.assign("metrics", "").unwrap();

    let mut orch = ContainerOrchestrator::new(config(&temp_dir, base), runner.clone())
        .with_registry(registry);
    let outcome = orch.run_full_cycle().unwrap();

    assert!(outcome.passed);
    assert_eq!(outcome.stdout, "all green");
    assert_eq!(orch.phase(), Phase::CleanedUp);

    let test_spec = runner
        .specs()
        .into_iter()
        .find(|s| s.program == "npm")
        .unwrap();
    let env: std::collections::BTreeMap<_, _> = test_spec.envs.into_iter().collect();
    assert_eq!(env["APP_PORT"], base.to_string());
    assert_eq!(env["HTTP_SERVER_PORT"], base.to_string());
    assert_eq!(env["POSTGRES_PORT"], (base + 1).to_string());
    assert_eq!(env["MONGO_PORT"], (base + 2).to_string());
    assert_eq!(env["METRICS_PORT"], "4000");

    let calls = runner.calls();
    assert!(calls.contains(&format!(
        "podman pod create --name test-env -p {}:5432 -p {}:27017",
        base + 1,
        base + 2
    )));
    assert!(calls.contains(&"podman pod rm -f test-env".to_string()));
    assert!(SessionRecord::load(&temp_dir.path().join(".berth"), "test-env").is_none());
}

#[test]
#[serial]
fn test_conflict_names_the_port() {
    let temp_dir = TempDir::new().unwrap();
    let base = free_block(3);
    let _holder = occupy(base + 2);
    let runner = Arc::new(FakeRunner::healthy_podman());

    let mut orch = ContainerOrchestrator::new(config(&temp_dir, base), runner.clone());
    let err = orch.run_full_cycle().unwrap_err();

    match &err {
        BerthError::PortConflict { message, ports } => {
            assert_eq!(ports, &vec![base + 2]);
            assert!(message.contains(&format!("{} already in use", base + 2)));
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(err.exit_code(), 1);
    assert!(!runner.calls().iter().any(|c| c.starts_with("podman run")));
}

#[test]
#[serial]
fn test_relocation_moves_past_conflict() {
    let temp_dir = TempDir::new().unwrap();
    let base = free_block(6);
    let _holder = occupy(base);
    let runner = Arc::new(FakeRunner::healthy_podman());

    let mut cfg = config(&temp_dir, base);
    cfg.ports.on_conflict = ConflictPolicy::Relocate;
    let mut orch = ContainerOrchestrator::new(cfg, runner);
    orch.detect_runtime().unwrap();
    let ports = orch.allocate_ports().unwrap();

    assert!(ports["app"] > base);
    assert_eq!(ports["postgres"], ports["app"] + 1);
    assert_eq!(ports["mongo"], ports["app"] + 2);
}

#[test]
#[serial]
fn test_unhealthy_containers_are_removed() {
    let temp_dir = TempDir::new().unwrap();
    let base = free_block(3);
    let runner = Arc::new(
        FakeRunner::new()
            .on("podman --version", ok("podman version 4.9.3"))
            .on("podman compose version", fail(125, "unknown command"))
            .on("podman-compose", fail(127, "command not found"))
            .on("podman exec test-postgres", fail(2, "no response"))
            .on("podman", ok("")),
    );

    let mut orch = ContainerOrchestrator::new(config(&temp_dir, base), runner.clone());
    let err = orch.run_full_cycle().unwrap_err();
    match err {
        BerthError::HealthTimeout { pending, .. } => assert_eq!(pending, vec!["test-postgres"]),
        other => panic!("unexpected: {:?}", other),
    }

    let calls = runner.calls();
    assert!(calls.contains(&"podman stop test-postgres".to_string()));
    assert!(calls.contains(&"podman stop test-mongo".to_string()));
    assert!(!calls.iter().any(|c| c.starts_with("npm")));
}

#[test]
#[serial]
fn test_start_then_stop() {
    let temp_dir = TempDir::new().unwrap();
    let base = free_block(3);
    let runner = Arc::new(FakeRunner::healthy_podman());
    let cfg = config(&temp_dir, base);
    let state_dir = cfg.containers.state_dir.clone();

    let mut starter = ContainerOrchestrator::new(cfg.clone(), runner.clone());
    starter.start_environment().unwrap();
    let record = SessionRecord::load(&state_dir, "test-env").unwrap();
    assert_eq!(record.ports["app"], base);

    let mut stopper = ContainerOrchestrator::new(cfg, runner.clone());
    stopper.teardown().unwrap();
    assert!(SessionRecord::load(&state_dir, "test-env").is_none());
    assert_eq!(stopper.phase(), Phase::CleanedUp);
}

#[test]
fn test_no_engine_installed() {
    let temp_dir = TempDir::new().unwrap();
    let runner = Arc::new(FakeRunner::new());
    let mut orch = ContainerOrchestrator::new(config(&temp_dir, 8090), runner.clone());

    let err = orch.run_full_cycle().unwrap_err();
    assert!(matches!(err, BerthError::NoRuntime));
    assert!(err.to_string().contains("No compatible container runtime found"));
    assert_eq!(runner.calls().len(), 4);
}
