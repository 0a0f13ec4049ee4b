use super::open_registry;
use crate::config::{Config, ConflictPolicy};
use crate::errors::Result;
use crate::exec::{CommandRunner, SystemRunner};
use crate::orchestrator::{ContainerOrchestrator, StartOutcome, TestOutcome};
use crate::runtime::RuntimeDetector;
use crate::signals::ShutdownSignal;
use colored::*;
use std::sync::Arc;

fn orchestrator(config: Config, shutdown: &ShutdownSignal) -> Result<ContainerOrchestrator> {
    let registry = Arc::new(open_registry(&config)?);
    let runner: Arc<dyn CommandRunner> =
        Arc::new(SystemRunner::new().with_shutdown(shutdown.clone()));
    Ok(ContainerOrchestrator::new(config, runner)
        .with_shutdown(shutdown.clone())
        .with_registry(registry))
}

fn with_policy(mut config: Config, relocate: bool) -> Config {
    if relocate {
        config.ports.on_conflict = ConflictPolicy::Relocate;
    }
    config
}

fn print_ports(orch: &ContainerOrchestrator) {
    println!("{:<15} {:<10}", "SERVICE", "PORT");
    println!("{}", "-".repeat(25));
    for (service, port) in orch.ports() {
        println!("{:<15} {:<10}", service, port);
    }
}

/// Show which engine would be used
pub fn runtime(config: &Config) -> Result<()> {
    let detector = RuntimeDetector::new(
        Arc::new(SystemRunner::new()),
        config.containers.probe_timeout(),
    );
    let runtime = detector.detect()?;

    println!("{:<10} {}", "Runtime:".bold(), runtime.name.green());
    println!("{:<10} {}", "Version:".bold(), runtime.version);
    println!("{:<10} {}", "Compose:".bold(), runtime.compose_display());
    Ok(())
}

/// Bring the environment up and leave it running
pub fn start(config: Config, relocate: bool, shutdown: &ShutdownSignal) -> Result<()> {
    let mut orch = orchestrator(with_policy(config, relocate), shutdown)?;

    let outcome = orch.start_environment()?;
    match outcome {
        StartOutcome::Started => println!(
            "{} Test environment '{}' is up",
            "✓".green().bold(),
            orch.project_name().cyan()
        ),
        StartOutcome::Reused => println!(
            "{} Test environment '{}' was already running",
            "✓".green().bold(),
            orch.project_name().cyan()
        ),
    }
    print_ports(&orch);
    Ok(())
}

/// Remove every configured container, pod, or compose project
pub fn stop(config: Config, shutdown: &ShutdownSignal) -> Result<()> {
    let mut orch = orchestrator(config, shutdown)?;
    orch.teardown()?;
    println!(
        "{} Test environment '{}' stopped",
        "✓".green().bold(),
        orch.project_name().cyan()
    );
    Ok(())
}

/// Full cycle: start, wait healthy, run tests, clean up
pub fn test(config: Config, relocate: bool, shutdown: &ShutdownSignal) -> Result<TestOutcome> {
    let mut orch = orchestrator(with_policy(config, relocate), shutdown)?;
    let outcome = orch.run_full_cycle()?;

    print!("{}", outcome.stdout);
    eprint!("{}", outcome.stderr);

    if outcome.passed {
        println!("{} Tests passed", "✓".green().bold());
    } else if outcome.timed_out {
        println!("{} Tests timed out", "✗".red().bold());
    } else {
        println!(
            "{} Tests failed (exit code {})",
            "✗".red().bold(),
            outcome
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string())
        );
    }
    Ok(outcome)
}
