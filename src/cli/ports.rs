use super::open_registry;
use crate::config::Config;
use crate::errors::{BerthError, Result};
use crate::exec::SystemRunner;
use crate::ports::{PortBlockChecker, ProcessAttributor, SequentialPortFinder};
use colored::*;
use std::sync::Arc;

fn host_or_default(config: &Config, host: Option<String>) -> String {
    host.unwrap_or_else(|| config.ports.host.clone())
}

/// Check one exact block and report who holds any busy port
pub fn check(
    config: &Config,
    base: u16,
    count: i32,
    host: Option<String>,
    json: bool,
) -> Result<()> {
    let host = host_or_default(config, host);
    let attributor = ProcessAttributor::for_host(Arc::new(SystemRunner::new()));
    let result = PortBlockChecker::new(&host, attributor).check(base, count);

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if result.available {
        let (start, end) = result.requested_range;
        println!(
            "{} Ports {}-{} are available on {}",
            "✓".green().bold(),
            start,
            end,
            host
        );
    } else if result.is_valid_range() {
        println!("{:<10} {}", "PORT", "HELD BY");
        println!("{}", "-".repeat(40));
        for info in &result.busy_ports {
            println!(
                "{:<10} {}",
                info.port.to_string().red(),
                info.process_info.as_deref().unwrap_or_default()
            );
        }
    }

    if result.available {
        return Ok(());
    }
    let message = result.error_message.clone().unwrap_or_default();
    if !result.is_valid_range() {
        return Err(BerthError::Validation(message));
    }
    Err(BerthError::PortConflict {
        message,
        ports: result.busy_ports.iter().map(|p| p.port).collect(),
    })
}

/// Search upward from `base` for `count` consecutive free ports
pub fn find(config: &Config, base: u16, count: i32, host: Option<String>) -> Result<()> {
    let host = host_or_default(config, host);
    let ports = SequentialPortFinder::new(&host)
        .with_max_attempts(config.ports.max_attempts)
        .find(base, count)?;

    let listed: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
    println!("{}", listed.join(" "));
    Ok(())
}

pub fn assign(config: &Config, service: &str, purpose: &str) -> Result<()> {
    let registry = open_registry(config)?;
    let port = registry.assign(service, purpose)?;
    println!("{} {} → {}", "✓".green().bold(), service.cyan(), port);
    Ok(())
}

pub fn get(config: &Config, service: &str) -> Result<()> {
    let registry = open_registry(config)?;
    match registry.get(service) {
        Some(port) => {
            println!("{}", port);
            Ok(())
        }
        None => Err(BerthError::Registry(format!(
            "No port assigned to '{}'",
            service
        ))),
    }
}

pub fn release(config: &Config, service: &str) -> Result<()> {
    let registry = open_registry(config)?;
    if registry.release(service)? {
        println!("Released port for '{}'", service);
    } else {
        println!("No port assigned to '{}'", service);
    }
    Ok(())
}

pub fn list(config: &Config, json: bool) -> Result<()> {
    let registry = open_registry(config)?;
    let assignments = registry.assignments();

    if json {
        println!("{}", serde_json::to_string_pretty(&registry.service_ports())?);
        return Ok(());
    }

    if assignments.is_empty() {
        println!("No port assignments found.");
        return Ok(());
    }

    println!(
        "{:<20} {:<8} {:<26} {}",
        "SERVICE", "PORT", "ASSIGNED", "PURPOSE"
    );
    println!("{}", "-".repeat(70));
    for assignment in assignments {
        println!(
            "{:<20} {:<8} {:<26} {}",
            assignment.service_name,
            assignment.port,
            assignment.assigned_at.format("%Y-%m-%d %H:%M:%S"),
            assignment.purpose
        );
    }
    println!();
    println!(
        "Next port: {} (base {})",
        registry.next_port(),
        registry.base_port()
    );
    Ok(())
}

pub fn reset(config: &Config) -> Result<()> {
    let registry = open_registry(config)?;
    registry.reset()?;
    println!(
        "{} Registry reset, next port is {}",
        "✓".green().bold(),
        registry.base_port()
    );
    Ok(())
}

/// Print assignments as `KEY=value` lines, ready for `export` or an env file
pub fn env(config: &Config) -> Result<()> {
    let registry = open_registry(config)?;
    for (key, value) in registry.export_env_vars() {
        println!("{}={}", key, value);
    }
    Ok(())
}
