// Best-effort identification of the process holding a port
//
// Each diagnosis tool is a strategy with its own parser over the tool's
// human-oriented output. Strategies are tried in a fixed order and the first
// answer wins; "unknown process" is the bottom value, never an error.

use crate::exec::{CommandRunner, CommandSpec};
use regex::Regex;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Description used when no tool could attribute the port
pub const UNKNOWN_PROCESS: &str = "unknown process";

/// Per-tool timeout
const TOOL_TIMEOUT: Duration = Duration::from_secs(5);

/// What a tool recovered about a port's owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOwner {
    pub name: Option<String>,
    pub pid: Option<u32>,
}

impl ProcessOwner {
    pub fn new(name: &str, pid: u32) -> Self {
        Self {
            name: Some(name.to_string()),
            pid: Some(pid),
        }
    }
}

impl fmt::Display for ProcessOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, self.pid) {
            (Some(name), Some(pid)) => write!(f, "process {} (PID {})", name, pid),
            (Some(name), None) => write!(f, "process {}", name),
            (None, Some(pid)) => write!(f, "process PID {}", pid),
            (None, None) => f.write_str(UNKNOWN_PROCESS),
        }
    }
}

/// One diagnosis tool
pub trait OwnerLookup: Send + Sync {
    /// Program name, for logs
    fn tool(&self) -> &'static str;

    fn command(&self, port: u16) -> CommandSpec;

    /// Recover the owner of `port` from the tool's stdout
    fn parse(&self, output: &str, port: u16) -> Option<ProcessOwner>;

    fn lookup(&self, runner: &dyn CommandRunner, port: u16) -> Option<ProcessOwner> {
        let output = runner
            .run(&self.command(port).timeout(TOOL_TIMEOUT))
            .ok()?;
        if !output.success() {
            return None;
        }
        self.parse(&output.stdout, port)
    }
}

/// True if a socket address column (`0.0.0.0:8090`, `[::]:8090`, `*:8090`) is on `port`
fn address_on_port(address: &str, port: u16) -> bool {
    address
        .rsplit_once(':')
        .map(|(_, p)| p == port.to_string())
        .unwrap_or(false)
}

/// `lsof -i :<port> -P -n`
pub struct Lsof;

impl OwnerLookup for Lsof {
    fn tool(&self) -> &'static str {
        "lsof"
    }

    fn command(&self, port: u16) -> CommandSpec {
        CommandSpec::new("lsof").args([
            "-i".to_string(),
            format!(":{}", port),
            "-P".into(),
            "-n".into(),
        ])
    }

    fn parse(&self, output: &str, _port: u16) -> Option<ProcessOwner> {
        // lsof already filtered by port; prefer the listening socket over clients
        let rows: Vec<&str> = output
            .lines()
            .skip(1)
            .filter(|l| !l.trim().is_empty())
            .collect();
        let row = rows
            .iter()
            .find(|l| l.contains("(LISTEN)"))
            .or_else(|| rows.first())?;

        let mut parts = row.split_whitespace();
        let name = parts.next()?;
        let pid = parts.next()?.parse().ok()?;
        Some(ProcessOwner::new(name, pid))
    }
}

/// `netstat -tulpn` (net-tools)
pub struct Netstat;

impl OwnerLookup for Netstat {
    fn tool(&self) -> &'static str {
        "netstat"
    }

    fn command(&self, _port: u16) -> CommandSpec {
        CommandSpec::new("netstat").arg("-tulpn")
    }

    fn parse(&self, output: &str, port: u16) -> Option<ProcessOwner> {
        static PID_PROGRAM: OnceLock<Regex> = OnceLock::new();
        let pid_program = PID_PROGRAM.get_or_init(|| Regex::new(r"^(\d+)/(.+)$").unwrap());

        output.lines().find_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            // tcp rows carry a State column, udp rows do not
            if parts.len() < 6 || !address_on_port(parts[3], port) {
                return None;
            }
            let caps = pid_program.captures(parts.last()?)?;
            let pid = caps[1].parse().ok()?;
            Some(ProcessOwner::new(&caps[2], pid))
        })
    }
}

/// `ss -tulpn` (iproute2)
pub struct Ss;

impl OwnerLookup for Ss {
    fn tool(&self) -> &'static str {
        "ss"
    }

    fn command(&self, _port: u16) -> CommandSpec {
        CommandSpec::new("ss").arg("-tulpn")
    }

    fn parse(&self, output: &str, port: u16) -> Option<ProcessOwner> {
        static USERS: OnceLock<Regex> = OnceLock::new();
        let users = USERS.get_or_init(|| Regex::new(r#"users:\(\("([^"]+)",pid=(\d+)"#).unwrap());

        output.lines().find_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 5 || !address_on_port(parts[4], port) {
                return None;
            }
            let caps = users.captures(line)?;
            let pid = caps[2].parse().ok()?;
            Some(ProcessOwner::new(&caps[1], pid))
        })
    }
}

/// `netstat -ano` cross-referenced with `tasklist` by PID
pub struct WindowsNetstat;

impl WindowsNetstat {
    fn tasklist_command(pid: u32) -> CommandSpec {
        CommandSpec::new("tasklist").args([
            "/FI".to_string(),
            format!("PID eq {}", pid),
            "/FO".to_string(),
            "CSV".to_string(),
        ])
    }
}

/// Image name from `tasklist /FO CSV` output (header row, then one row per match)
pub fn parse_tasklist(output: &str) -> Option<String> {
    let row = output.lines().nth(1)?;
    if !row.starts_with('"') {
        return None;
    }
    row.split('"').nth(1).map(str::to_string)
}

impl OwnerLookup for WindowsNetstat {
    fn tool(&self) -> &'static str {
        "netstat"
    }

    fn command(&self, _port: u16) -> CommandSpec {
        CommandSpec::new("netstat").arg("-ano")
    }

    fn parse(&self, output: &str, port: u16) -> Option<ProcessOwner> {
        output.lines().find_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 5 || !line.contains("LISTENING") || !address_on_port(parts[1], port) {
                return None;
            }
            let pid = parts[4].parse().ok()?;
            Some(ProcessOwner { name: None, pid: Some(pid) })
        })
    }

    fn lookup(&self, runner: &dyn CommandRunner, port: u16) -> Option<ProcessOwner> {
        let output = runner
            .run(&self.command(port).timeout(TOOL_TIMEOUT))
            .ok()?;
        if !output.success() {
            return None;
        }
        let mut owner = self.parse(&output.stdout, port)?;

        if let Some(pid) = owner.pid {
            owner.name = runner
                .run(&Self::tasklist_command(pid).timeout(TOOL_TIMEOUT))
                .ok()
                .filter(|o| o.success())
                .and_then(|o| parse_tasklist(&o.stdout));
        }
        Some(owner)
    }
}

/// Runs the lookup strategies in priority order
pub struct ProcessAttributor {
    runner: Arc<dyn CommandRunner>,
    strategies: Vec<Box<dyn OwnerLookup>>,
}

impl ProcessAttributor {
    /// Strategies appropriate for the platform this binary runs on
    pub fn for_host(runner: Arc<dyn CommandRunner>) -> Self {
        let strategies: Vec<Box<dyn OwnerLookup>> = if cfg!(windows) {
            vec![Box::new(WindowsNetstat)]
        } else {
            vec![Box::new(Lsof), Box::new(Netstat), Box::new(Ss)]
        };
        Self::with_strategies(runner, strategies)
    }

    pub fn with_strategies(
        runner: Arc<dyn CommandRunner>,
        strategies: Vec<Box<dyn OwnerLookup>>,
    ) -> Self {
        Self { runner, strategies }
    }

    /// First owner any strategy can identify
    pub fn owner(&self, port: u16) -> Option<ProcessOwner> {
        self.strategies.iter().find_map(|strategy| {
            let owner = strategy.lookup(self.runner.as_ref(), port);
            if owner.is_none() {
                tracing::debug!(tool = strategy.tool(), port, "no owner found");
            }
            owner
        })
    }

    /// Owner description, falling back to "unknown process"
    pub fn describe(&self, port: u16) -> String {
        self.owner(port)
            .map(|owner| owner.to_string())
            .unwrap_or_else(|| UNKNOWN_PROCESS.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::test_support::{fail, ok, ScriptedRunner};

    const LSOF_OUTPUT: &str = "\
COMMAND     PID USER   FD   TYPE DEVICE SIZE/OFF NODE NAME
curl      20011 dev    5u  IPv4 998877      0t0  TCP 127.0.0.1:51000->127.0.0.1:8090 (ESTABLISHED)
python3   12345 dev    3u  IPv4 123456      0t0  TCP *:8090 (LISTEN)
";

    const NETSTAT_OUTPUT: &str = "\
Active Internet connections (only servers)
Proto Recv-Q Send-Q Local Address           Foreign Address         State       PID/Program name
tcp        0      0 0.0.0.0:80901           0.0.0.0:*               LISTEN      1/wrong
tcp        0      0 0.0.0.0:8091            0.0.0.0:*               LISTEN      4242/postgres
tcp6       0      0 :::8092                 :::*                    LISTEN      -
udp        0      0 0.0.0.0:5353            0.0.0.0:*                           678/avahi-daemon
";

    const SS_OUTPUT: &str = "\
Netid State  Recv-Q Send-Q Local Address:Port  Peer Address:Port Process
tcp   LISTEN 0      4096   0.0.0.0:8092        0.0.0.0:*         users:((\"mongod\",pid=5150,fd=11))
tcp   LISTEN 0      128    [::]:8090           [::]:*            users:((\"node\",pid=777,fd=20),(\"node\",pid=778,fd=20))
";

    const WINDOWS_NETSTAT_OUTPUT: &str = "
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:8090           0.0.0.0:0              LISTENING       4321
  TCP    127.0.0.1:8090         127.0.0.1:51000        ESTABLISHED     4321
";

    #[test]
    fn test_owner_display() {
        assert_eq!(ProcessOwner::new("python3", 12).to_string(), "process python3 (PID 12)");
        let pid_only = ProcessOwner { name: None, pid: Some(9) };
        assert_eq!(pid_only.to_string(), "process PID 9");
        let nothing = ProcessOwner { name: None, pid: None };
        assert_eq!(nothing.to_string(), UNKNOWN_PROCESS);
    }

    #[test]
    fn test_lsof_prefers_listening_row() {
        assert_eq!(Lsof.parse(LSOF_OUTPUT, 8090), Some(ProcessOwner::new("python3", 12345)));
        assert_eq!(Lsof.parse("COMMAND PID USER\n", 8090), None);
    }

    #[test]
    fn test_netstat_matches_exact_port() {
        assert_eq!(Netstat.parse(NETSTAT_OUTPUT, 8091), Some(ProcessOwner::new("postgres", 4242)));
        // PID column hidden without privileges
        assert_eq!(Netstat.parse(NETSTAT_OUTPUT, 8092), None);
        assert_eq!(
            Netstat.parse(NETSTAT_OUTPUT, 5353),
            Some(ProcessOwner::new("avahi-daemon", 678))
        );
        assert_eq!(Netstat.parse(NETSTAT_OUTPUT, 9999), None);
    }

    #[test]
    fn test_ss_parses_users_column() {
        assert_eq!(Ss.parse(SS_OUTPUT, 8092), Some(ProcessOwner::new("mongod", 5150)));
        assert_eq!(Ss.parse(SS_OUTPUT, 8090), Some(ProcessOwner::new("node", 777)));
        assert_eq!(Ss.parse(SS_OUTPUT, 8091), None);
    }

    #[test]
    fn test_windows_netstat_and_tasklist() {
        assert_eq!(
            WindowsNetstat.parse(WINDOWS_NETSTAT_OUTPUT, 8090),
            Some(ProcessOwner { name: None, pid: Some(4321) })
        );
        let tasklist = "\"Image Name\",\"PID\",\"Session Name\"\n\"python.exe\",\"4321\",\"Console\"\n";
        assert_eq!(parse_tasklist(tasklist), Some("python.exe".to_string()));
        assert_eq!(parse_tasklist("INFO: No tasks are running.\n"), None);
    }

    #[test]
    fn test_windows_lookup_cross_references_pid() {
        let runner = ScriptedRunner::new()
            .on("netstat -ano", ok(WINDOWS_NETSTAT_OUTPUT))
            .on("tasklist", ok("\"Image Name\",\"PID\"\n\"python.exe\",\"4321\"\n"));
        let owner = WindowsNetstat.lookup(&runner, 8090).unwrap();
        assert_eq!(owner.to_string(), "process python.exe (PID 4321)");
        assert!(runner.calls().iter().any(|c| c == "tasklist /FI PID eq 4321 /FO CSV"));
    }

    #[test]
    fn test_windows_lookup_without_tasklist_reports_pid() {
        let runner = ScriptedRunner::new()
            .on("netstat -ano", ok(WINDOWS_NETSTAT_OUTPUT))
            .missing("tasklist");
        let owner = WindowsNetstat.lookup(&runner, 8090).unwrap();
        assert_eq!(owner.to_string(), "process PID 4321");
    }

    #[test]
    fn test_strategies_fall_through_in_order() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .missing("lsof")
                .on("netstat", fail(1, "permission denied"))
                .on("ss", ok(SS_OUTPUT)),
        );
        let attributor = ProcessAttributor::with_strategies(
            runner.clone(),
            vec![Box::new(Lsof), Box::new(Netstat), Box::new(Ss)],
        );
        assert_eq!(attributor.describe(8092), "process mongod (PID 5150)");
        assert_eq!(
            runner.calls(),
            vec!["lsof -i :8092 -P -n", "netstat -tulpn", "ss -tulpn"]
        );
    }

    #[test]
    fn test_no_tools_yields_unknown_process() {
        let runner = Arc::new(ScriptedRunner::new());
        let attributor = ProcessAttributor::with_strategies(
            runner,
            vec![Box::new(Lsof), Box::new(Netstat), Box::new(Ss)],
        );
        assert_eq!(attributor.owner(8090), None);
        assert_eq!(attributor.describe(8090), UNKNOWN_PROCESS);
    }

    #[test]
    fn test_tool_calls_are_time_bounded() {
        let runner = Arc::new(ScriptedRunner::new().on("lsof", ok(LSOF_OUTPUT)));
        let attributor = ProcessAttributor::with_strategies(runner.clone(), vec![Box::new(Lsof)]);
        attributor.describe(8090);
        assert_eq!(runner.specs()[0].timeout, Some(TOOL_TIMEOUT));
    }
}
