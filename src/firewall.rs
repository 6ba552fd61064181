//! Firewall Rule Builder
//!
//! Keeps workload containers away from private networks using iptables.
//! iptables is not idempotent, so every pass rebuilds the isolation chain
//! from a flushed state instead of diffing:
//!
//! 1. ensure the isolation chain exists and the parent chain jumps into it
//!    (probed first, installed once, never flushed)
//! 2. flush the isolation chain
//! 3. insert interface accepts, then per private range the
//!    established/related and DNS allows
//! 4. append a drop per private range, so drops land after every accept
//! 5. append a final RETURN so unmatched traffic falls back to the parent chain
//!
//! A failed mutation aborts the pass and leaves the flushed chain behind;
//! the next scheduled rebuild is the retry.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::FirewallConfig;
use crate::shell::{CommandRunner, ShellError};

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("Invalid firewall configuration: {0}")]
    InvalidConfig(String),

    #[error("Firewall command '{command}' failed: {source}")]
    Command {
        command: String,
        #[source]
        source: ShellError,
    },
}

/// Role of a command within a rebuild pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Flush,
    AcceptInterface,
    AllowEstablished,
    AllowDns,
    DropPrivate,
    Return,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallStep {
    pub kind: StepKind,
    pub command: String,
}

/// Result of an existence probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Absent,
    Present,
    Error(String),
}

/// Summary of a successful pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub chain_created: bool,
    pub jump_installed: bool,
    pub rules_applied: usize,
}

pub struct FirewallRuleBuilder {
    config: FirewallConfig,
    runner: Arc<dyn CommandRunner>,
}

impl FirewallRuleBuilder {
    pub fn new(config: FirewallConfig, runner: Arc<dyn CommandRunner>) -> Result<Self, FirewallError> {
        validate(&config)?;
        Ok(Self { config, runner })
    }

    fn iptables(&self) -> &'static str {
        if self.config.use_sudo {
            "sudo iptables"
        } else {
            "iptables"
        }
    }

    pub fn chain_probe_command(&self) -> String {
        format!("{} -L {}", self.iptables(), self.config.chain)
    }

    pub fn chain_create_command(&self) -> String {
        format!("{} -N {}", self.iptables(), self.config.chain)
    }

    pub fn jump_probe_command(&self) -> String {
        format!(
            "{} -C {} -j {}",
            self.iptables(),
            self.config.parent_chain,
            self.config.chain
        )
    }

    pub fn jump_install_command(&self) -> String {
        format!(
            "{} -I {} -j {}",
            self.iptables(),
            self.config.parent_chain,
            self.config.chain
        )
    }

    /// Ordered mutations of one rebuild pass, starting with the flush
    pub fn rule_plan(&self) -> Vec<FirewallStep> {
        let ipt = self.iptables();
        let chain = &self.config.chain;
        let subnet = &self.config.internal_subnet;
        let mut steps = Vec::new();

        steps.push(FirewallStep {
            kind: StepKind::Flush,
            command: format!("{} -F {}", ipt, chain),
        });

        for iface in &self.config.interfaces {
            steps.push(FirewallStep {
                kind: StepKind::AcceptInterface,
                command: format!("{} -I {} -i {} -o {} -j ACCEPT", ipt, chain, iface, iface),
            });
        }

        for range in &self.config.private_ranges {
            steps.push(FirewallStep {
                kind: StepKind::AllowEstablished,
                command: format!(
                    "{} -I {} -s {} -d {} -m state --state RELATED,ESTABLISHED -j ACCEPT",
                    ipt, chain, subnet, range
                ),
            });
            steps.push(FirewallStep {
                kind: StepKind::AllowDns,
                command: format!(
                    "{} -I {} -s {} -d {} -p udp --dport 53 -j ACCEPT",
                    ipt, chain, subnet, range
                ),
            });
        }

        for range in &self.config.private_ranges {
            steps.push(FirewallStep {
                kind: StepKind::DropPrivate,
                command: format!("{} -A {} -s {} -d {} -j DROP", ipt, chain, subnet, range),
            });
        }

        steps.push(FirewallStep {
            kind: StepKind::Return,
            command: format!("{} -A {} -j RETURN", ipt, chain),
        });

        steps
    }

    async fn probe(&self, command: &str) -> ProbeOutcome {
        match self.runner.run_exclusive(command).await {
            Ok(output) if output.success() => ProbeOutcome::Present,
            Ok(_) => ProbeOutcome::Absent,
            Err(e) => ProbeOutcome::Error(e.to_string()),
        }
    }

    async fn mutate(&self, command: &str) -> Result<(), FirewallError> {
        debug!("Firewall: {}", command);
        self.runner
            .run_checked(command)
            .await
            .map(|_| ())
            .map_err(|source| {
                error!("Firewall command failed: {} ({})", command, source);
                FirewallError::Command {
                    command: command.to_string(),
                    source,
                }
            })
    }

    /// Run one full rebuild pass
    pub async fn apply(&self) -> Result<ApplyReport, FirewallError> {
        let mut report = ApplyReport::default();

        let chain_probe = self.chain_probe_command();
        match self.probe(&chain_probe).await {
            ProbeOutcome::Present => {}
            ProbeOutcome::Absent => {
                let create = self.chain_create_command();
                match self.runner.run_checked(&create).await {
                    Ok(_) => {
                        info!("Created firewall chain {}", self.config.chain);
                        report.chain_created = true;
                    }
                    Err(e) => warn!("Could not create chain {}: {}", self.config.chain, e),
                }
            }
            ProbeOutcome::Error(e) => warn!("Chain probe '{}' failed: {}", chain_probe, e),
        }

        let jump_probe = self.jump_probe_command();
        match self.probe(&jump_probe).await {
            ProbeOutcome::Present => {}
            ProbeOutcome::Absent => {
                self.mutate(&self.jump_install_command()).await?;
                info!(
                    "Installed jump from {} to {}",
                    self.config.parent_chain, self.config.chain
                );
                report.jump_installed = true;
            }
            ProbeOutcome::Error(e) => warn!("Jump probe '{}' failed: {}", jump_probe, e),
        }

        for step in self.rule_plan() {
            self.mutate(&step.command).await?;
            report.rules_applied += 1;
        }

        info!(
            "Firewall chain {} rebuilt with {} rules",
            self.config.chain, report.rules_applied
        );
        Ok(report)
    }

    /// Rebuild now and then every `interval` until shutdown
    pub async fn run_periodic(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.apply().await {
                error!("Firewall rebuild failed: {}", e);
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Firewall rebuild task stopped");
    }
}

/// Final chain order after running `plan` on a flushed chain.
///
/// `-I` inserts at the head and `-A` appends, so this is the order the
/// kernel evaluates rules in.
pub fn effective_rules(plan: &[FirewallStep]) -> Vec<String> {
    let mut rules: Vec<String> = Vec::new();
    for step in plan {
        let parts: Vec<&str> = step.command.split_whitespace().collect();
        let Some(pos) = parts.iter().position(|p| p.starts_with('-')) else {
            continue;
        };
        let rule = parts.get(pos + 2..).unwrap_or_default().join(" ");
        match parts[pos] {
            "-F" => rules.clear(),
            "-I" => rules.insert(0, rule),
            "-A" => rules.push(rule),
            _ => {}
        }
    }
    rules
}

fn validate(config: &FirewallConfig) -> Result<(), FirewallError> {
    for (what, value) in [
        ("chain", &config.chain),
        ("parent_chain", &config.parent_chain),
    ] {
        if !is_token(value) {
            return Err(FirewallError::InvalidConfig(format!(
                "{} '{}' must be a single non-empty word",
                what, value
            )));
        }
    }

    for iface in &config.interfaces {
        if !is_token(iface) {
            return Err(FirewallError::InvalidConfig(format!(
                "interface '{}' must be a single non-empty word",
                iface
            )));
        }
    }

    if !is_cidr(&config.internal_subnet) {
        return Err(FirewallError::InvalidConfig(format!(
            "internal_subnet '{}' is not a CIDR range",
            config.internal_subnet
        )));
    }

    if let Some(bad) = config.private_ranges.iter().find(|r| !is_cidr(r)) {
        return Err(FirewallError::InvalidConfig(format!(
            "private range '{}' is not a CIDR range",
            bad
        )));
    }

    Ok(())
}

fn is_token(s: &str) -> bool {
    !s.is_empty() && !s.starts_with('-') && !s.chars().any(char::is_whitespace)
}

fn is_cidr(s: &str) -> bool {
    let Some((addr, prefix)) = s.split_once('/') else {
        return false;
    };
    let Ok(addr) = addr.parse::<IpAddr>() else {
        return false;
    };
    let Ok(prefix) = prefix.parse::<u8>() else {
        return false;
    };
    match addr {
        IpAddr::V4(_) => prefix <= 32,
        IpAddr::V6(_) => prefix <= 128,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::CommandOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn config() -> FirewallConfig {
        FirewallConfig {
            enabled: true,
            use_sudo: false,
            interfaces: vec!["eth0".to_string(), "wg0".to_string()],
            private_ranges: vec!["10.0.0.0/8".to_string(), "192.168.0.0/16".to_string()],
            ..FirewallConfig::default()
        }
    }

    /// Records commands; exits non-zero for any command containing `failing`
    struct ScriptedRunner {
        commands: Mutex<Vec<String>>,
        failing: Vec<&'static str>,
    }

    impl ScriptedRunner {
        fn new(failing: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                commands: Mutex::new(Vec::new()),
                failing,
            })
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, command: &str) -> Result<CommandOutput, ShellError> {
            self.commands.lock().unwrap().push(command.to_string());
            let failed = self.failing.iter().any(|f| command.contains(f));
            Ok(CommandOutput {
                code: Some(if failed { 1 } else { 0 }),
                stdout: String::new(),
                stderr: if failed { "bad rule".to_string() } else { String::new() },
            })
        }
    }

    #[test]
    fn test_drops_after_accepts_and_single_trailing_return() {
        let builder = FirewallRuleBuilder::new(config(), ScriptedRunner::new(vec![])).unwrap();
        let plan = builder.rule_plan();

        assert_eq!(plan[0].kind, StepKind::Flush);
        let last_accept = plan
            .iter()
            .rposition(|s| s.kind != StepKind::DropPrivate && s.kind != StepKind::Return)
            .unwrap();
        let first_drop = plan.iter().position(|s| s.kind == StepKind::DropPrivate).unwrap();
        assert!(first_drop > last_accept);
        assert_eq!(plan.iter().filter(|s| s.kind == StepKind::Return).count(), 1);
        assert_eq!(plan.last().unwrap().kind, StepKind::Return);

        let rules = effective_rules(&plan);
        let last_accept = rules.iter().rposition(|r| r.ends_with("ACCEPT")).unwrap();
        let first_drop = rules.iter().position(|r| r.ends_with("DROP")).unwrap();
        assert!(first_drop > last_accept);
        assert_eq!(rules.last().unwrap(), "-j RETURN");
        assert_eq!(rules.len(), 2 + 2 * 2 + 2 + 1);
    }

    #[test]
    fn test_drop_and_allow_commands() {
        let builder = FirewallRuleBuilder::new(config(), ScriptedRunner::new(vec![])).unwrap();
        let commands: Vec<String> = builder.rule_plan().into_iter().map(|s| s.command).collect();

        assert!(commands.contains(
            &"iptables -A DOCKER-USER -s 172.23.0.0/16 -d 10.0.0.0/8 -j DROP".to_string()
        ));
        assert!(commands.contains(
            &"iptables -I DOCKER-USER -s 172.23.0.0/16 -d 192.168.0.0/16 -p udp --dport 53 -j ACCEPT"
                .to_string()
        ));
        assert!(commands.contains(&"iptables -I DOCKER-USER -i wg0 -o wg0 -j ACCEPT".to_string()));
    }

    #[test]
    fn test_sudo_prefix() {
        let mut cfg = config();
        cfg.use_sudo = true;
        let builder = FirewallRuleBuilder::new(cfg, ScriptedRunner::new(vec![])).unwrap();
        assert_eq!(builder.chain_probe_command(), "sudo iptables -L DOCKER-USER");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = config();
        cfg.private_ranges.push("10.0.0.0".to_string());
        assert!(FirewallRuleBuilder::new(cfg, ScriptedRunner::new(vec![])).is_err());

        let mut cfg = config();
        cfg.interfaces.push("eth0 -j ACCEPT".to_string());
        assert!(FirewallRuleBuilder::new(cfg, ScriptedRunner::new(vec![])).is_err());

        let mut cfg = config();
        cfg.internal_subnet = "172.23.0.0/40".to_string();
        assert!(FirewallRuleBuilder::new(cfg, ScriptedRunner::new(vec![])).is_err());
    }

    #[tokio::test]
    async fn test_apply_installs_missing_chain_and_jump() {
        let runner = ScriptedRunner::new(vec![" -L ", " -C "]);
        let builder = FirewallRuleBuilder::new(config(), runner.clone()).unwrap();

        let report = builder.apply().await.unwrap();
        assert!(report.chain_created);
        assert!(report.jump_installed);
        assert_eq!(report.rules_applied, builder.rule_plan().len());

        let commands = runner.commands();
        assert_eq!(commands[0], "iptables -L DOCKER-USER");
        assert_eq!(commands[1], "iptables -N DOCKER-USER");
        assert_eq!(commands[2], "iptables -C FORWARD -j DOCKER-USER");
        assert_eq!(commands[3], "iptables -I FORWARD -j DOCKER-USER");
        assert_eq!(commands[4], "iptables -F DOCKER-USER");
    }

    #[tokio::test]
    async fn test_apply_skips_existing_jump() {
        let runner = ScriptedRunner::new(vec![]);
        let builder = FirewallRuleBuilder::new(config(), runner.clone()).unwrap();

        let report = builder.apply().await.unwrap();
        assert!(!report.chain_created);
        assert!(!report.jump_installed);
        assert!(!runner.commands().iter().any(|c| c.contains(" -I FORWARD ")));
    }

    #[tokio::test]
    async fn test_apply_aborts_on_failed_accept() {
        let runner = ScriptedRunner::new(vec!["--dport 53"]);
        let builder = FirewallRuleBuilder::new(config(), runner.clone()).unwrap();

        let err = builder.apply().await.unwrap_err();
        assert!(matches!(err, FirewallError::Command { .. }));

        // Nothing after the failing allow was attempted
        let commands = runner.commands();
        assert!(commands.last().unwrap().contains("--dport 53"));
        assert!(!commands.iter().any(|c| c.ends_with("DROP")));
    }
}
