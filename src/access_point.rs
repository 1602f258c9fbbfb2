//! Access point controller.
//!
//! Owns the declarative side effects of AP mode: the dnsmasq configuration
//! that answers every DNS query with the gateway address, the IPv4
//! forwarding knob, and the firewall policy that rewrites inbound HTTP(S)
//! on the wireless interface to the portal port. `apply` and `restore` are
//! both idempotent, and `apply` snapshots the pre-existing dnsmasq
//! configuration exactly once so `restore` can put it back.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::backend::run_bounded;
use crate::config::PortalConfig;
use crate::error::BackendError;

/// Hard upper bound on a provisioning command (systemctl, iptables-restore).
const RUNNER_TIMEOUT: Duration = Duration::from_secs(15);

/// Thin seam over external system commands (systemctl, iptables-restore),
/// so provisioning can be tested without touching the host.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> Result<(), BackendError>;

    /// Run with `input` fed to stdin. Used for `iptables-restore`, which
    /// commits a whole ruleset in one kernel transaction.
    fn run_with_input(&self, program: &str, args: &[&str], input: &str) -> Result<(), BackendError>;
}

/// [`CommandRunner`] over real processes.
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<(), BackendError> {
        check_status(program, run_bounded(program, args, None, RUNNER_TIMEOUT)?)
    }

    fn run_with_input(&self, program: &str, args: &[&str], input: &str) -> Result<(), BackendError> {
        check_status(
            program,
            run_bounded(program, args, Some(input), RUNNER_TIMEOUT)?,
        )
    }
}

fn check_status(program: &str, output: std::process::Output) -> Result<(), BackendError> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BackendError::CommandFailed(format!(
            "{program}: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

/// Filesystem locations the controller touches. Defaults are the real
/// system paths; tests point them into a temp directory.
#[derive(Debug, Clone)]
pub struct SystemPaths {
    pub dnsmasq_conf: PathBuf,
    /// Snapshot of the pre-portal dnsmasq configuration, written at most
    /// once per install.
    pub dnsmasq_snapshot: PathBuf,
    pub ip_forward: PathBuf,
}

impl Default for SystemPaths {
    fn default() -> Self {
        SystemPaths {
            dnsmasq_conf: PathBuf::from("/etc/dnsmasq.conf"),
            dnsmasq_snapshot: PathBuf::from("/etc/dnsmasq.conf.original"),
            ip_forward: PathBuf::from("/proc/sys/net/ipv4/ip_forward"),
        }
    }
}

/// Outcome of [`AccessPointController::restore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restore {
    Restored,
    /// No snapshot existed; nothing was touched. Defined no-op, not an error.
    NothingToRestore,
}

pub struct AccessPointController {
    config: PortalConfig,
    paths: SystemPaths,
    runner: Box<dyn CommandRunner>,
}

impl AccessPointController {
    pub fn new(config: PortalConfig) -> Self {
        Self::with_parts(config, SystemPaths::default(), Box::new(SystemRunner))
    }

    pub fn with_parts(config: PortalConfig, paths: SystemPaths, runner: Box<dyn CommandRunner>) -> Self {
        AccessPointController {
            config,
            paths,
            runner,
        }
    }

    /// Provision DNS redirection, forwarding, and the firewall policy.
    ///
    /// Every step runs even if an earlier one failed; failures accumulate
    /// and the return value is true only when all of them succeeded. A
    /// partially configured portal still serves clients better than none.
    pub fn apply(&self) -> bool {
        info!("applying access point configuration");
        let mut ok = true;

        let steps: [(&str, Result<()>); 3] = [
            ("dnsmasq", self.setup_dnsmasq()),
            ("ip forwarding", self.enable_ip_forwarding()),
            ("firewall rules", self.install_firewall()),
        ];
        for (step, result) in steps {
            if let Err(err) = result {
                error!(step, error = %err, "provisioning step failed");
                ok = false;
            }
        }

        if ok {
            info!("access point configuration applied");
        } else {
            warn!("access point configuration applied with errors");
        }
        ok
    }

    /// Undo [`apply`](Self::apply): put the snapshotted dnsmasq
    /// configuration back and drop the portal firewall policy. Without a
    /// snapshot this is a no-op. Partial failures are logged and the
    /// remaining steps still run.
    pub fn restore(&self) -> Restore {
        if !self.paths.dnsmasq_snapshot.exists() {
            info!("no pre-portal snapshot present, nothing to restore");
            return Restore::NothingToRestore;
        }

        info!("restoring pre-portal configuration");
        if let Err(err) = self.restore_dnsmasq() {
            error!(error = %err, "failed to restore dnsmasq configuration");
        }
        if let Err(err) = self.clear_firewall() {
            error!(error = %err, "failed to clear portal firewall rules");
        }
        Restore::Restored
    }

    fn setup_dnsmasq(&self) -> Result<()> {
        // Snapshot the original exactly once; later applies must not
        // overwrite it with our own generated config.
        if self.paths.dnsmasq_conf.exists() && !self.paths.dnsmasq_snapshot.exists() {
            fs::copy(&self.paths.dnsmasq_conf, &self.paths.dnsmasq_snapshot).with_context(|| {
                format!(
                    "Failed to snapshot {} to {}",
                    self.paths.dnsmasq_conf.display(),
                    self.paths.dnsmasq_snapshot.display()
                )
            })?;
            info!(
                snapshot = %self.paths.dnsmasq_snapshot.display(),
                "saved pre-portal dnsmasq configuration"
            );
        }

        fs::write(&self.paths.dnsmasq_conf, self.dnsmasq_config()).with_context(|| {
            format!("Failed to write {}", self.paths.dnsmasq_conf.display())
        })?;
        self.runner.run("systemctl", &["restart", "dnsmasq"])?;
        Ok(())
    }

    fn restore_dnsmasq(&self) -> Result<()> {
        fs::copy(&self.paths.dnsmasq_snapshot, &self.paths.dnsmasq_conf).with_context(|| {
            format!(
                "Failed to restore {} from {}",
                self.paths.dnsmasq_conf.display(),
                self.paths.dnsmasq_snapshot.display()
            )
        })?;
        self.runner.run("systemctl", &["restart", "dnsmasq"])?;
        Ok(())
    }

    fn enable_ip_forwarding(&self) -> Result<()> {
        fs::write(&self.paths.ip_forward, "1").with_context(|| {
            format!("Failed to write {}", self.paths.ip_forward.display())
        })?;
        Ok(())
    }

    fn install_firewall(&self) -> Result<()> {
        // iptables-restore replaces the whole table set in one commit, so a
        // concurrent observer sees either the previous policy or the
        // complete portal policy, never a half-built mix.
        self.runner
            .run_with_input("iptables-restore", &[], &self.firewall_rules())?;
        Ok(())
    }

    fn clear_firewall(&self) -> Result<()> {
        self.runner
            .run_with_input("iptables-restore", &[], OPEN_RULESET)?;
        Ok(())
    }

    /// dnsmasq configuration for the portal: DHCP on the AP subnet, the
    /// gateway as router and resolver, and wildcard DNS pointing everything
    /// at the portal.
    fn dnsmasq_config(&self) -> String {
        let c = &self.config;
        format!(
            "# captive portal dnsmasq configuration\n\
             interface={iface}\n\
             dhcp-range={start},{end},{netmask},{lease}\n\
             dhcp-option=3,{gw}\n\
             dhcp-option=6,{gw}\n\
             address=/#/{gw}\n",
            iface = c.interface,
            start = c.dhcp_range_start,
            end = c.dhcp_range_end,
            netmask = netmask_from_prefix(c.prefix_len),
            lease = c.lease_time,
            gw = c.gateway,
        )
    }

    /// Complete iptables policy in `iptables-restore` format: accept
    /// established/local/ssh/dns/dhcp/http traffic and DNAT ports 80 and
    /// 443 on the wireless interface to the portal service.
    fn firewall_rules(&self) -> String {
        let c = &self.config;
        let iface = &c.interface;
        let target = c.redirect_target();
        format!(
            "*filter\n\
             :INPUT ACCEPT [0:0]\n\
             :FORWARD ACCEPT [0:0]\n\
             :OUTPUT ACCEPT [0:0]\n\
             -A INPUT -m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT\n\
             -A INPUT -i lo -j ACCEPT\n\
             -A INPUT -p tcp --dport 22 -j ACCEPT\n\
             -A INPUT -i {iface} -p udp --dport 53 -j ACCEPT\n\
             -A INPUT -i {iface} -p tcp --dport 53 -j ACCEPT\n\
             -A INPUT -i {iface} -p udp --dport 67 -j ACCEPT\n\
             -A INPUT -i {iface} -p tcp --dport 80 -j ACCEPT\n\
             -A INPUT -i {iface} -p tcp --dport 443 -j ACCEPT\n\
             -A INPUT -i {iface} -p tcp --dport {port} -j ACCEPT\n\
             COMMIT\n\
             *nat\n\
             :PREROUTING ACCEPT [0:0]\n\
             :INPUT ACCEPT [0:0]\n\
             :OUTPUT ACCEPT [0:0]\n\
             :POSTROUTING ACCEPT [0:0]\n\
             -A PREROUTING -i {iface} -p tcp --dport 80 -j DNAT --to-destination {target}\n\
             -A PREROUTING -i {iface} -p tcp --dport 443 -j DNAT --to-destination {target}\n\
             COMMIT\n",
            port = c.portal_port,
        )
    }
}

/// Empty accept-everything tables, used to drop the portal policy.
const OPEN_RULESET: &str = "*filter\n\
    :INPUT ACCEPT [0:0]\n\
    :FORWARD ACCEPT [0:0]\n\
    :OUTPUT ACCEPT [0:0]\n\
    COMMIT\n\
    *nat\n\
    :PREROUTING ACCEPT [0:0]\n\
    :INPUT ACCEPT [0:0]\n\
    :OUTPUT ACCEPT [0:0]\n\
    :POSTROUTING ACCEPT [0:0]\n\
    COMMIT\n";

fn netmask_from_prefix(prefix_len: u8) -> String {
    let mask = u32::MAX
        .checked_shl(32 - u32::from(prefix_len.min(32)))
        .unwrap_or(0);
    format!(
        "{}.{}.{}.{}",
        mask >> 24,
        (mask >> 16) & 0xff,
        (mask >> 8) & 0xff,
        mask & 0xff
    )
}


#[cfg(test)]
mod tests {
    use std::fs;

    use super::testing::test_controller;
    use super::*;

    #[test]
    fn apply_snapshots_original_config_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _runner) = test_controller(PortalConfig::default(), dir.path());

        fs::write(dir.path().join("dnsmasq.conf"), "# original operator config\n").unwrap();

        assert!(controller.apply());
        let snapshot = fs::read_to_string(dir.path().join("dnsmasq.conf.original")).unwrap();
        assert_eq!(snapshot, "# original operator config\n");

        // A second apply rewrites the live config but must not touch the
        // snapshot, which now differs from the live file.
        assert!(controller.apply());
        let snapshot_again = fs::read_to_string(dir.path().join("dnsmasq.conf.original")).unwrap();
        assert_eq!(snapshot_again, "# original operator config\n");
    }

    #[test]
    fn repeated_apply_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, runner) = test_controller(PortalConfig::default(), dir.path());

        assert!(controller.apply());
        let conf_once = fs::read_to_string(dir.path().join("dnsmasq.conf")).unwrap();
        let rules_once = runner
            .invocations()
            .into_iter()
            .find(|i| i.program == "iptables-restore")
            .and_then(|i| i.input)
            .unwrap();

        assert!(controller.apply());
        let conf_twice = fs::read_to_string(dir.path().join("dnsmasq.conf")).unwrap();
        let rules_twice = runner
            .invocations()
            .into_iter()
            .filter(|i| i.program == "iptables-restore")
            .next_back()
            .and_then(|i| i.input)
            .unwrap();

        assert_eq!(conf_once, conf_twice);
        assert_eq!(rules_once, rules_twice);
        assert_eq!(fs::read_to_string(dir.path().join("ip_forward")).unwrap(), "1");
    }

    #[test]
    fn firewall_policy_lands_in_one_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, runner) = test_controller(PortalConfig::default(), dir.path());

        assert!(controller.apply());

        // One iptables-restore invocation carrying the complete policy; no
        // incremental iptables calls that an observer could catch halfway.
        assert_eq!(runner.count("iptables-restore"), 1);
        assert_eq!(runner.count("iptables"), 0);
        let rules = runner
            .invocations()
            .into_iter()
            .find(|i| i.program == "iptables-restore")
            .and_then(|i| i.input)
            .unwrap();
        assert!(rules.contains("--dport 80 -j DNAT --to-destination 10.42.0.1:5000"));
        assert!(rules.contains("--dport 443 -j DNAT --to-destination 10.42.0.1:5000"));
        assert!(rules.contains("*nat"));
    }

    #[test]
    fn dnsmasq_config_redirects_all_dns_to_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _runner) = test_controller(PortalConfig::default(), dir.path());

        assert!(controller.apply());
        let conf = fs::read_to_string(dir.path().join("dnsmasq.conf")).unwrap();
        assert!(conf.contains("address=/#/10.42.0.1"));
        assert!(conf.contains("dhcp-range=10.42.0.2,10.42.0.20,255.255.255.0,24h"));
        assert!(conf.contains("interface=wlan0"));
    }

    #[test]
    fn restore_without_snapshot_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, runner) = test_controller(PortalConfig::default(), dir.path());

        fs::write(dir.path().join("dnsmasq.conf"), "untouched\n").unwrap();
        assert_eq!(controller.restore(), Restore::NothingToRestore);

        assert_eq!(
            fs::read_to_string(dir.path().join("dnsmasq.conf")).unwrap(),
            "untouched\n"
        );
        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn restore_puts_the_snapshot_back() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, runner) = test_controller(PortalConfig::default(), dir.path());

        fs::write(dir.path().join("dnsmasq.conf"), "# original operator config\n").unwrap();
        assert!(controller.apply());
        assert_ne!(
            fs::read_to_string(dir.path().join("dnsmasq.conf")).unwrap(),
            "# original operator config\n"
        );

        assert_eq!(controller.restore(), Restore::Restored);
        assert_eq!(
            fs::read_to_string(dir.path().join("dnsmasq.conf")).unwrap(),
            "# original operator config\n"
        );
        // The portal NAT policy is dropped in the same atomic fashion.
        let last = runner.invocations().into_iter().next_back().unwrap();
        assert_eq!(last.program, "iptables-restore");
        assert!(!last.input.unwrap().contains("DNAT"));
    }

    #[test]
    fn failed_step_does_not_abort_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, runner) = test_controller(PortalConfig::default(), dir.path());

        runner.fail_program("systemctl");
        assert!(!controller.apply());

        // dnsmasq restart failed, but forwarding and the firewall policy
        // were still attempted.
        assert_eq!(fs::read_to_string(dir.path().join("ip_forward")).unwrap(), "1");
        assert_eq!(runner.count("iptables-restore"), 1);
    }

    #[test]
    fn netmask_conversion() {
        assert_eq!(netmask_from_prefix(24), "255.255.255.0");
        assert_eq!(netmask_from_prefix(16), "255.255.0.0");
        assert_eq!(netmask_from_prefix(25), "255.255.255.128");
        assert_eq!(netmask_from_prefix(0), "0.0.0.0");
    }
}
