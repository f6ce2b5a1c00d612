use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{ReachError, Result};
use crate::net::rules::{CountingRule, Hook, RuleAction, RuleCounter, RuleSelector};
use crate::net::{HostProvisioner, HostSpec, PacketFilter, Probe, Protocol, Service, Topology};

/// Drives router namespaces through command-line tools.
///
/// - counting rules live in the `mangle` table and are added with
///   `iptables-restore --noflush`, so other jobs' rules are never touched
/// - counters come from `iptables-save -c`
/// - probes are emitted with `hping3`, carrying the tag in the DSCP field
/// - host, service and neighbor provisioning is delegated to `host_tool`
/// - paths come from `trace_tool <source> <destination>`, which prints a
///   JSON array of router names
#[derive(Debug, Clone)]
pub struct ShellBackend {
    pub host_tool: PathBuf,
    pub trace_tool: PathBuf,
    /// Prefix every command with `sudo -n`.
    pub sudo: bool,
}

impl ShellBackend {
    pub fn new(host_tool: impl Into<PathBuf>, trace_tool: impl Into<PathBuf>) -> Self {
        Self {
            host_tool: host_tool.into(),
            trace_tool: trace_tool.into(),
            sudo: false,
        }
    }

    fn command(&self, program: &str, args: &[String]) -> Command {
        let mut cmd = if self.sudo {
            let mut c = Command::new("sudo");
            c.arg("-n").arg(program);
            c
        } else {
            Command::new(program)
        };
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let output = self.command(program, args).output().await;
        Self::process_output(program, args, output)
    }

    async fn run_with_input(&self, program: &str, args: &[String], input: &str) -> Result<String> {
        let mut child = self
            .command(program, args)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| ReachError::Provisioning(format!("cannot start {program}: {e}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await?;
        }
        let output = child.wait_with_output().await;
        Self::process_output(program, args, output)
    }

    fn process_output(
        program: &str,
        args: &[String],
        result: std::result::Result<std::process::Output, std::io::Error>,
    ) -> Result<String> {
        match result {
            Ok(output) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::debug!(program, args = ?args, exit_code = ?output.status.code(), "Command failed");
                Err(ReachError::Provisioning(format!(
                    "{program} {} failed ({:?}): {}",
                    args.join(" "),
                    output.status.code(),
                    stderr.trim()
                )))
            }
            Err(e) => Err(ReachError::Provisioning(format!("cannot run {program}: {e}"))),
        }
    }

    /// `ip netns exec <ns> <program> <args...>`
    async fn in_netns(&self, ns: &str, program: &str, args: &[&str]) -> Result<String> {
        let mut full = vec!["netns".to_string(), "exec".to_string(), ns.to_string(), program.to_string()];
        full.extend(args.iter().map(|a| a.to_string()));
        self.run("ip", &full).await
    }

    async fn host_tool(&self, args: &[&str]) -> Result<()> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let tool = self.host_tool.to_string_lossy().into_owned();
        self.run(&tool, &args).await.map(|_| ())
    }
}

fn table_for(hook: Hook) -> &'static str {
    match hook {
        Hook::PreRouting | Hook::PostRouting => "mangle",
        Hook::Forward => "filter",
    }
}

/// Match part shared by install and delete.
fn rule_spec(rule: &CountingRule) -> String {
    let mut spec = format!("-p {}", rule.service.protocol);
    if rule.service.protocol != Protocol::Icmp {
        spec.push_str(&format!(" --dport {}", rule.service.port));
    }
    spec.push_str(&format!(
        " -m dscp --dscp {} -m comment --comment {}",
        rule.tag,
        rule.comment()
    ));
    spec
}

/// `iptables-restore --noflush` input appending `rules`.
pub fn restore_script(rules: &[CountingRule]) -> String {
    let mut script = String::from("*mangle\n");
    for rule in rules {
        script.push_str(&format!("-A {} {}\n", rule.hook.chain(), rule_spec(rule)));
    }
    script.push_str("COMMIT\n");
    script
}

fn unquote(token: &str) -> &str {
    token.trim_matches('"')
}

/// One `-A` line of `iptables-save [-c]` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedRule {
    pub chain: String,
    pub packets: u64,
    pub bytes: u64,
    pub target: Option<String>,
    pub comment: Option<String>,
    /// Everything after `-A`, usable with `iptables -D`.
    pub spec: Vec<String>,
}

pub fn parse_save_line(line: &str) -> Option<SavedRule> {
    let line = line.trim();
    let (packets, bytes, rest) = match line.strip_prefix('[') {
        Some(counted) => {
            let (counters, rest) = counted.split_once(']')?;
            let (p, b) = counters.split_once(':')?;
            (p.parse().ok()?, b.parse().ok()?, rest.trim())
        }
        None => (0, 0, line),
    };
    let rest = rest.strip_prefix("-A ")?;
    let spec: Vec<String> = rest.split_whitespace().map(|t| unquote(t).to_string()).collect();
    let chain = spec.first()?.clone();

    let value_after = |flag: &str| {
        spec.iter()
            .position(|t| t == flag)
            .and_then(|i| spec.get(i + 1))
            .cloned()
    };
    Some(SavedRule {
        chain,
        packets,
        bytes,
        target: value_after("-j"),
        comment: value_after("--comment"),
        spec,
    })
}

/// Counting rules of this crate found in `iptables-save -c -t mangle` output.
pub fn parse_counting_rules(save: &str, selector: &RuleSelector) -> Vec<(SavedRule, CountingRule)> {
    save.lines()
        .filter_map(parse_save_line)
        .filter_map(|saved| {
            let rule = CountingRule::parse_comment(saved.comment.as_deref()?)?;
            selector.matches(&rule).then_some((saved, rule))
        })
        .collect()
}

/// Every rule of the FORWARD chain, numbered from 1 in table order.
pub fn parse_forward_chain(save: &str) -> Vec<RuleCounter> {
    save.lines()
        .filter_map(parse_save_line)
        .filter(|saved| saved.chain == "FORWARD")
        .enumerate()
        .map(|(i, saved)| RuleCounter {
            rule_id: match &saved.comment {
                Some(comment) => format!("FORWARD:{}:{}", i + 1, comment),
                None => format!("FORWARD:{}", i + 1),
            },
            hook: Hook::Forward,
            action: saved
                .target
                .as_deref()
                .map(RuleAction::from_target)
                .unwrap_or(RuleAction::Other),
            counting: None,
            packets: saved.packets,
            bytes: saved.bytes,
        })
        .collect()
}

/// hping3 arguments for one probe.
pub fn probe_args(probe: &Probe) -> Vec<String> {
    let mut args = vec!["-q".to_string(), "-c".to_string(), probe.count.max(1).to_string()];
    match probe.service.protocol {
        Protocol::Tcp => args.extend(["-S".to_string(), "-p".to_string(), probe.service.port.to_string()]),
        Protocol::Udp => args.extend(["-2".to_string(), "-p".to_string(), probe.service.port.to_string()]),
        Protocol::Icmp => args.push("-1".to_string()),
    }
    if let Some(tag) = probe.tag {
        // TOS byte carries DSCP in its upper six bits
        args.extend(["-o".to_string(), format!("{:x}", tag << 2)]);
    }
    args.extend(["-a".to_string(), probe.source.to_string()]);
    args.push(probe.destination.to_string());
    args
}

#[async_trait]
impl Topology for ShellBackend {
    async fn resolve_path(&self, source: IpAddr, destination: IpAddr) -> Result<Vec<String>> {
        let tool = self.trace_tool.to_string_lossy().into_owned();
        let out = self
            .run(&tool, &[source.to_string(), destination.to_string()])
            .await?;
        let path: Vec<String> = serde_json::from_str(out.trim())?;
        Ok(path)
    }
}

#[async_trait]
impl HostProvisioner for ShellBackend {
    async fn create_host(&self, host: &HostSpec) -> Result<()> {
        let address = host.address.to_string();
        self.host_tool(&["host", "add", &host.name, &address, &host.router])
            .await
    }

    async fn remove_host(&self, name: &str) -> Result<()> {
        self.host_tool(&["host", "remove", name]).await
    }

    async fn create_ephemeral_service(&self, host: &str, service: &Service) -> Result<()> {
        let port = service.port.to_string();
        let proto = service.protocol.to_string();
        self.host_tool(&["service", "start", host, &port, &proto]).await
    }

    async fn stop_service(&self, host: &str, service: &Service) -> Result<()> {
        let port = service.port.to_string();
        let proto = service.protocol.to_string();
        self.host_tool(&["service", "stop", host, &port, &proto]).await
    }

    async fn add_neighbor(&self, router: &str, address: IpAddr) -> Result<()> {
        let address = address.to_string();
        self.host_tool(&["neighbor", "add", router, &address]).await
    }

    async fn remove_neighbor(&self, router: &str, address: IpAddr) -> Result<()> {
        let address = address.to_string();
        self.host_tool(&["neighbor", "remove", router, &address]).await
    }
}

#[async_trait]
impl PacketFilter for ShellBackend {
    async fn install_rules(&self, router: &str, rules: &[CountingRule]) -> Result<()> {
        if rules.is_empty() {
            return Ok(());
        }
        let args: Vec<String> = ["netns", "exec", router, "iptables-restore", "--noflush"]
            .iter()
            .map(|a| a.to_string())
            .collect();
        self.run_with_input("ip", &args, &restore_script(rules))
            .await
            .map(|_| ())
    }

    async fn delete_rules(&self, router: &str, selector: &RuleSelector) -> Result<usize> {
        let save = self.in_netns(router, "iptables-save", &["-t", "mangle"]).await?;
        let matched = parse_counting_rules(&save, selector);
        let mut removed = 0;
        let mut last_error = None;
        for (saved, _) in &matched {
            let mut args = vec!["-t", "mangle", "-D"];
            args.extend(saved.spec.iter().map(String::as_str));
            match self.in_netns(router, "iptables", &args).await {
                Ok(_) => removed += 1,
                Err(e) => {
                    tracing::warn!(router, error = %e, "Rule delete failed");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            None => Ok(removed),
            Some(e) => Err(ReachError::Provisioning(format!(
                "{} of {} rules left on {router}: {e}",
                matched.len() - removed,
                matched.len()
            ))),
        }
    }

    async fn read_counters(&self, router: &str, selector: &RuleSelector) -> Result<Vec<RuleCounter>> {
        if selector.hook == Some(Hook::Forward) {
            let save = self
                .in_netns(router, "iptables-save", &["-c", "-t", table_for(Hook::Forward)])
                .await?;
            return Ok(parse_forward_chain(&save));
        }
        let save = self
            .in_netns(router, "iptables-save", &["-c", "-t", table_for(Hook::PreRouting)])
            .await?;
        Ok(parse_counting_rules(&save, selector)
            .into_iter()
            .map(|(saved, rule)| RuleCounter {
                rule_id: rule.comment(),
                hook: rule.hook,
                action: RuleAction::Other,
                counting: Some(rule),
                packets: saved.packets,
                bytes: saved.bytes,
            })
            .collect())
    }

    async fn send_probe(&self, probe: &Probe) -> Result<()> {
        let args = probe_args(probe);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match self.in_netns(&probe.origin, "hping3", &args).await {
            Ok(_) => Ok(()),
            // hping3 exits non-zero when nothing answers, which is a valid outcome
            Err(ReachError::Provisioning(msg)) if !msg.starts_with("cannot run") => {
                tracing::debug!(origin = %probe.origin, detail = %msg, "Probe got no reply");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn restore_script_appends_to_mangle() {
        let job = Uuid::nil();
        let script = restore_script(&CountingRule::pair(32, job, Service::tcp(80)));
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "*mangle");
        assert!(lines[1].starts_with("-A PREROUTING -p tcp --dport 80 -m dscp --dscp 32"));
        assert!(lines[2].starts_with("-A POSTROUTING"));
        assert_eq!(lines[3], "COMMIT");
    }

    #[test]
    fn icmp_rules_have_no_port() {
        let [pre, _] = CountingRule::pair(40, Uuid::nil(), Service::icmp());
        assert!(!rule_spec(&pre).contains("--dport"));
    }

    #[test]
    fn parses_counted_save_lines() {
        let job = Uuid::new_v4();
        let [pre, _] = CountingRule::pair(33, job, Service::udp(53));
        let save = format!(
            "# Generated by iptables-save\n*mangle\n:PREROUTING ACCEPT [0:0]\n\
             [7:420] -A PREROUTING {}\n[1:60] -A PREROUTING -p tcp -j MARK --set-mark 1\nCOMMIT\n",
            rule_spec(&pre)
        );
        let found = parse_counting_rules(&save, &RuleSelector::tag(33));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0.packets, 7);
        assert_eq!(found[0].0.bytes, 420);
        assert_eq!(found[0].1, pre);
        assert_eq!(found[0].0.spec[0], "PREROUTING");
    }

    #[test]
    fn parses_forward_chain_actions() {
        let save = "*filter\n\
                    [3:180] -A FORWARD -p tcp -m tcp --dport 22 -m comment --comment \"ssh-deny\" -j DROP\n\
                    [9:540] -A FORWARD -j ACCEPT\n\
                    [1:60] -A INPUT -j ACCEPT\nCOMMIT\n";
        let rules = parse_forward_chain(save);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].rule_id, "FORWARD:1:ssh-deny");
        assert_eq!(rules[0].action, RuleAction::Drop);
        assert_eq!(rules[1].action, RuleAction::Accept);
        assert_eq!(rules[1].packets, 9);
    }

    #[test]
    fn probe_args_carry_dscp() {
        let probe = Probe {
            origin: "r1".into(),
            source: "10.0.0.1".parse().unwrap(),
            destination: "10.0.1.1".parse().unwrap(),
            service: Service::udp(53),
            tag: Some(32),
            count: 3,
        };
        let args = probe_args(&probe);
        assert!(args.windows(2).any(|w| w == ["-c", "3"]));
        assert!(args.contains(&"-2".to_string()));
        assert!(args.windows(2).any(|w| w == ["-o", "80"]));
        assert_eq!(args.last().map(String::as_str), Some("10.0.1.1"));
    }
}
