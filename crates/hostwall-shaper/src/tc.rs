//! Interface-wide shaping through `tc`
//!
//! Applies a profile as:
//!
//! ```text
//! tc qdisc del dev IF root                                   (may fail: nothing installed)
//! tc qdisc add dev IF root handle 1: htb default 10
//! tc class add dev IF parent 1: classid 1:10 htb rate Rkbit burst Bkbit
//! tc qdisc add dev IF parent 1:10 handle 10: netem delay Lms
//! ```
//!
//! Each step runs only after the previous one succeeded. Once the root
//! qdisc is in place, any later failure removes it again.

use crate::{Result, ShaperError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Captured result of an external command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs external programs
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Runs commands with `tokio::process`
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        use tokio::process::Command;

        let output = Command::new(program).args(args).output().await?;

        Ok(CommandOutput {
            success: output.status.success(),
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Host checks made before any command runs
pub trait Preflight: Send + Sync {
    fn interface_exists(&self, iface: &str) -> bool;
    fn is_privileged(&self) -> bool;
}

/// Checks `/sys/class/net` and the effective uid
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemPreflight;

impl Preflight for SystemPreflight {
    fn interface_exists(&self, iface: &str) -> bool {
        Path::new("/sys/class/net").join(iface).exists()
    }

    fn is_privileged(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }
}

/// Link-wide shaping parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeProfile {
    /// Sustained rate in kbit/s
    pub rate_kbit: u64,
    /// Burst in kbit
    pub burst_kbit: u64,
    /// Added one-way latency in milliseconds
    #[serde(default)]
    pub latency_ms: u32,
}

impl ShapeProfile {
    pub fn validate(&self) -> Result<()> {
        if self.rate_kbit == 0 {
            return Err(ShaperError::InvalidParameter {
                name: "rate_kbit",
                reason: "must be positive".into(),
            });
        }
        if self.burst_kbit == 0 {
            return Err(ShaperError::InvalidParameter {
                name: "burst_kbit",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Applies and clears [`ShapeProfile`]s on network interfaces
pub struct InterfaceShaper {
    runner: Box<dyn CommandRunner>,
    preflight: Box<dyn Preflight>,
    program: String,
}

impl InterfaceShaper {
    /// Shaper using the system `tc`
    pub fn new() -> Self {
        Self::with_backends(TokioCommandRunner, SystemPreflight)
    }

    pub fn with_backends(runner: impl CommandRunner + 'static, preflight: impl Preflight + 'static) -> Self {
        Self {
            runner: Box::new(runner),
            preflight: Box::new(preflight),
            program: "tc".to_string(),
        }
    }

    /// Use a different `tc` binary
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Install `profile` on `iface`, replacing whatever root qdisc it had.
    ///
    /// Returns the commands that ran, in order.
    pub async fn apply(&self, iface: &str, profile: &ShapeProfile) -> Result<Vec<String>> {
        profile.validate()?;
        self.check(iface)?;

        let mut executed = Vec::new();

        // Fails harmlessly when no root qdisc exists yet
        let reset = args(&["qdisc", "del", "dev", iface, "root"]);
        match self.exec(&reset).await {
            Ok(_) => {}
            Err(ShaperError::CommandFailed { stderr, .. }) => {
                debug!(iface, stderr = %stderr.trim(), "No root qdisc to remove");
            }
            Err(e) => return Err(e),
        }
        executed.push(self.render(&reset));

        let root = args(&["qdisc", "add", "dev", iface, "root", "handle", "1:", "htb", "default", "10"]);
        self.exec(&root).await?;
        executed.push(self.render(&root));

        let rate = format!("{}kbit", profile.rate_kbit);
        let burst = format!("{}kbit", profile.burst_kbit);
        let class = args(&[
            "class", "add", "dev", iface, "parent", "1:", "classid", "1:10", "htb", "rate", &rate,
            "burst", &burst,
        ]);
        if let Err(e) = self.exec(&class).await {
            self.rollback(iface).await;
            return Err(e);
        }
        executed.push(self.render(&class));

        let delay = format!("{}ms", profile.latency_ms);
        let netem = args(&[
            "qdisc", "add", "dev", iface, "parent", "1:10", "handle", "10:", "netem", "delay", &delay,
        ]);
        if let Err(e) = self.exec(&netem).await {
            self.rollback(iface).await;
            return Err(e);
        }
        executed.push(self.render(&netem));

        info!(
            iface,
            rate_kbit = profile.rate_kbit,
            burst_kbit = profile.burst_kbit,
            latency_ms = profile.latency_ms,
            "Shaping applied"
        );
        Ok(executed)
    }

    /// Remove shaping from `iface`
    pub async fn clear(&self, iface: &str) -> Result<()> {
        self.check(iface)?;
        self.exec(&args(&["qdisc", "del", "dev", iface, "root"])).await?;
        info!(iface, "Shaping cleared");
        Ok(())
    }

    fn check(&self, iface: &str) -> Result<()> {
        validate_iface_name(iface)?;
        if !self.preflight.interface_exists(iface) {
            return Err(ShaperError::InterfaceNotFound(iface.to_string()));
        }
        if !self.preflight.is_privileged() {
            return Err(ShaperError::NotPrivileged(iface.to_string()));
        }
        Ok(())
    }

    async fn rollback(&self, iface: &str) {
        let reset = args(&["qdisc", "del", "dev", iface, "root"]);
        if let Err(e) = self.exec(&reset).await {
            warn!(iface, error = %e, "Failed to remove partial shaping");
        }
    }

    async fn exec(&self, args: &[String]) -> Result<CommandOutput> {
        let command = self.render(args);
        debug!(command = %command, "Running");

        let output = self
            .runner
            .run(&self.program, args)
            .await
            .map_err(|source| ShaperError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.success {
            return Err(ShaperError::CommandFailed {
                command,
                status: output.status,
                stderr: output.stderr,
                stdout: output.stdout,
            });
        }
        Ok(output)
    }

    fn render(&self, args: &[String]) -> String {
        let mut line = self.program.clone();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl Default for InterfaceShaper {
    fn default() -> Self {
        Self::new()
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Kernel interface names: 1..=15 bytes, no whitespace or `/`
fn validate_iface_name(iface: &str) -> Result<()> {
    let valid = !iface.is_empty()
        && iface.len() <= 15
        && iface != "."
        && iface != ".."
        && iface.bytes().all(|b| b.is_ascii_graphic() && b != b'/');

    if valid {
        Ok(())
    } else {
        Err(ShaperError::InvalidParameter {
            name: "interface",
            reason: format!("{iface:?} is not a valid interface name"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Records commands; fails the ones whose rendered text contains `fail_on`
    #[derive(Clone, Default)]
    struct MockRunner {
        log: Arc<Mutex<Vec<String>>>,
        fail_on: Vec<&'static str>,
    }

    #[async_trait]
    impl CommandRunner for MockRunner {
        async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
            let line = format!("{} {}", program, args.join(" "));
            self.log.lock().push(line.clone());

            let failed = self.fail_on.iter().any(|pattern| line.contains(pattern));
            Ok(CommandOutput {
                success: !failed,
                status: Some(if failed { 2 } else { 0 }),
                stdout: String::new(),
                stderr: if failed { "RTNETLINK answers: Invalid argument".into() } else { String::new() },
            })
        }
    }

    struct FakeHost {
        iface: &'static str,
        root: bool,
    }

    impl Preflight for FakeHost {
        fn interface_exists(&self, iface: &str) -> bool {
            iface == self.iface
        }

        fn is_privileged(&self) -> bool {
            self.root
        }
    }

    fn shaper(runner: MockRunner, root: bool) -> InterfaceShaper {
        InterfaceShaper::with_backends(runner, FakeHost { iface: "eth0", root })
    }

    fn profile() -> ShapeProfile {
        ShapeProfile {
            rate_kbit: 1000,
            burst_kbit: 32,
            latency_ms: 20,
        }
    }

    #[tokio::test]
    async fn test_apply_sequence() {
        let runner = MockRunner::default();
        let log = Arc::clone(&runner.log);

        let executed = shaper(runner, true).apply("eth0", &profile()).await.unwrap();

        let expected = vec![
            "tc qdisc del dev eth0 root",
            "tc qdisc add dev eth0 root handle 1: htb default 10",
            "tc class add dev eth0 parent 1: classid 1:10 htb rate 1000kbit burst 32kbit",
            "tc qdisc add dev eth0 parent 1:10 handle 10: netem delay 20ms",
        ];
        assert_eq!(*log.lock(), expected);
        assert_eq!(executed, expected);
    }

    #[tokio::test]
    async fn test_missing_root_qdisc_is_tolerated() {
        let runner = MockRunner {
            fail_on: vec!["qdisc del"],
            ..Default::default()
        };
        assert!(shaper(runner, true).apply("eth0", &profile()).await.is_ok());
    }

    #[tokio::test]
    async fn test_class_failure_rolls_back() {
        let runner = MockRunner {
            fail_on: vec!["class add"],
            ..Default::default()
        };
        let log = Arc::clone(&runner.log);

        let err = shaper(runner, true).apply("eth0", &profile()).await.unwrap_err();
        match err {
            ShaperError::CommandFailed { command, status, stderr, .. } => {
                assert!(command.contains("class add dev eth0"));
                assert_eq!(status, Some(2));
                assert!(stderr.contains("Invalid argument"));
            }
            other => panic!("unexpected: {other}"),
        }

        let log = log.lock();
        assert_eq!(log.len(), 4);
        assert_eq!(log[3], "tc qdisc del dev eth0 root");
    }

    #[tokio::test]
    async fn test_netem_failure_rolls_back() {
        let runner = MockRunner {
            fail_on: vec!["netem"],
            ..Default::default()
        };
        let log = Arc::clone(&runner.log);

        assert!(shaper(runner, true).apply("eth0", &profile()).await.is_err());
        assert_eq!(log.lock().last().map(String::as_str), Some("tc qdisc del dev eth0 root"));
    }

    #[tokio::test]
    async fn test_root_add_failure_stops_early() {
        let runner = MockRunner {
            fail_on: vec!["root handle 1:"],
            ..Default::default()
        };
        let log = Arc::clone(&runner.log);

        assert!(shaper(runner, true).apply("eth0", &profile()).await.is_err());
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_preconditions() {
        let runner = MockRunner::default();
        let log = Arc::clone(&runner.log);

        let err = shaper(runner.clone(), true).apply("wlan9", &profile()).await.unwrap_err();
        assert!(matches!(err, ShaperError::InterfaceNotFound(name) if name == "wlan9"));

        let err = shaper(runner.clone(), false).apply("eth0", &profile()).await.unwrap_err();
        assert!(matches!(err, ShaperError::NotPrivileged(_)));

        let zero = ShapeProfile { rate_kbit: 0, ..profile() };
        let err = shaper(runner.clone(), true).apply("eth0", &zero).await.unwrap_err();
        assert!(matches!(err, ShaperError::InvalidParameter { name: "rate_kbit", .. }));

        let err = shaper(runner, true).apply("../eth0", &profile()).await.unwrap_err();
        assert!(matches!(err, ShaperError::InvalidParameter { name: "interface", .. }));

        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_zero_latency_allowed() {
        let runner = MockRunner::default();
        let log = Arc::clone(&runner.log);
        let flat = ShapeProfile { latency_ms: 0, ..profile() };

        shaper(runner, true).apply("eth0", &flat).await.unwrap();
        assert!(log.lock()[3].ends_with("netem delay 0ms"));
    }

    #[tokio::test]
    async fn test_clear() {
        let runner = MockRunner::default();
        let log = Arc::clone(&runner.log);

        shaper(runner, true).clear("eth0").await.unwrap();
        assert_eq!(*log.lock(), vec!["tc qdisc del dev eth0 root"]);
    }
}
