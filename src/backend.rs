//! Network backend adapter.
//!
//! Wraps NetworkManager's `nmcli` behind a typed interface: scanning,
//! connecting, querying the active connection, enumerating saved profiles,
//! and bringing up the access point profile. Everything else in the system
//! works with the records defined here; raw colon-delimited nmcli text never
//! leaves this module.
//!
//! The [`NetworkBackend`] trait is the seam the supervisor and the portal
//! gateway are written against, so both can be exercised in tests without a
//! radio present.

use std::collections::HashSet;
use std::io::Write;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PortalConfig;
use crate::error::BackendError;

/// Upper bound on the wait for a connection profile to reach "activated".
/// Activation is asynchronous on the NetworkManager side; past this point
/// the attempt is reported as a timeout, never as success-by-default.
pub const ACTIVATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between activation checks while waiting.
const ACTIVATION_POLL: Duration = Duration::from_secs(1);

/// Hard upper bound on a single nmcli invocation. Connect commands block
/// inside NetworkManager while it associates, so this is generous; past it
/// the child is killed and the call reports a timeout.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Security schemes a scanned network advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Security {
    Open,
    Wep,
    Wpa,
    Wpa2,
}

/// One network discovered by a scan pass. Produced fresh per scan and never
/// persisted here; saved profiles live in NetworkManager.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkRecord {
    pub ssid: String,
    /// Signal strength as a percentage (0-100).
    pub signal: u8,
    pub security: Vec<Security>,
}

/// Why a connect attempt did not produce a working client link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    AuthenticationFailed,
    Timeout,
    CommandFailed,
    BackendUnavailable,
}

impl FailureReason {
    /// User-facing text for the portal page. Deliberately free of raw
    /// backend diagnostics.
    pub fn user_message(&self) -> &'static str {
        match self {
            FailureReason::AuthenticationFailed => "Invalid password. Please try again.",
            FailureReason::Timeout => "The network did not come up in time. Please try again.",
            FailureReason::CommandFailed | FailureReason::BackendUnavailable => {
                "Failed to connect to the network. Please try again."
            }
        }
    }
}

/// Outcome of a single connect attempt. Created once per attempt and handed
/// back to whoever asked (supervisor or portal gateway).
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionResult {
    pub success: bool,
    pub ssid: String,
    /// Assigned address, when it could be resolved. Absence on an otherwise
    /// successful connect is "unknown", not failure.
    pub ip_address: Option<String>,
    pub signal_strength: Option<u8>,
    pub failure_reason: Option<FailureReason>,
}

impl ConnectionResult {
    pub fn connected(ssid: &str, ip_address: Option<String>, signal_strength: Option<u8>) -> Self {
        ConnectionResult {
            success: true,
            ssid: ssid.to_string(),
            ip_address,
            signal_strength,
            failure_reason: None,
        }
    }

    pub fn failed(ssid: &str, reason: FailureReason) -> Self {
        ConnectionResult {
            success: false,
            ssid: ssid.to_string(),
            ip_address: None,
            signal_strength: None,
            failure_reason: Some(reason),
        }
    }
}

/// Snapshot of the currently joined client network. Fetched fresh on every
/// query: signal and address drift between reads, so nothing caches this.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveConnectionInfo {
    pub ssid: String,
    pub ip_address: Option<String>,
    pub signal_strength: Option<u8>,
    pub device: String,
}

/// Capability-oriented interface over the host's wireless configuration
/// subsystem. One implementation talks to nmcli; tests substitute fakes.
///
/// Every method is idempotent with respect to repeated calls with the same
/// arguments, and none of them retries internally: retry policy belongs to
/// the supervisor loop.
pub trait NetworkBackend: Send + Sync {
    /// One scan pass. De-duplicated by SSID (first occurrence wins), never
    /// contains the device's own AP SSID, and an empty or unavailable radio
    /// produces an empty list rather than an error.
    fn scan(&self) -> Result<Vec<NetworkRecord>, BackendError>;

    /// Connect to `ssid`, updating the saved profile's credential if one
    /// exists or creating a profile from scratch otherwise, then wait
    /// (bounded) for activation. Every failure mode is folded into the
    /// result; this call has exactly one outcome shape.
    fn connect(&self, ssid: &str, password: Option<&str>) -> ConnectionResult;

    /// Take down the named connection. Already-down is success.
    fn disconnect(&self, ssid: &str) -> Result<(), BackendError>;

    /// The currently activated wireless connection, if any. Includes the AP
    /// profile when the device is in AP mode; callers compare against their
    /// configured AP SSID.
    fn active_connection(&self) -> Result<Option<ActiveConnectionInfo>, BackendError>;

    /// Saved wireless profile names minus the exclusion set, in the order
    /// the backend reports them (NetworkManager's own autoconnect-priority /
    /// last-used ordering; the core applies no re-sorting).
    fn saved_profiles(&self, excluding: &[String]) -> Result<Vec<String>, BackendError>;

    /// Create the AP profile if missing and activate it. Safe to call when
    /// the AP is already up.
    fn activate_access_point(&self, config: &PortalConfig) -> Result<(), BackendError>;
}

/// nmcli-backed implementation of [`NetworkBackend`].
pub struct NmcliBackend {
    ap_ssid: String,
}

impl NmcliBackend {
    pub fn new(ap_ssid: impl Into<String>) -> Self {
        NmcliBackend {
            ap_ssid: ap_ssid.into(),
        }
    }

    /// Run nmcli and hand back stdout. A missing or non-executable binary
    /// maps to `Unavailable`, a non-zero exit to `CommandFailed` carrying
    /// whatever diagnostic text the tool produced.
    fn nmcli(&self, args: &[&str]) -> Result<String, BackendError> {
        let output = run_bounded("nmcli", args, None, COMMAND_TIMEOUT)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let diag = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(BackendError::CommandFailed(diag.trim().to_string()));
        }

        decode_output(output.stdout)
    }

    fn profile_exists(&self, name: &str) -> Result<bool, BackendError> {
        let out = self.nmcli(&["-t", "-f", "NAME", "connection", "show"])?;
        Ok(out.lines().any(|line| line.trim() == name))
    }

    /// Poll the active-connection list until `ssid` shows "activated",
    /// returning the device it came up on. Bounded by [`ACTIVATION_TIMEOUT`].
    fn wait_for_activation(&self, ssid: &str) -> Result<String, BackendError> {
        let deadline = Instant::now() + ACTIVATION_TIMEOUT;
        loop {
            let out = self.nmcli(&["-t", "-f", "NAME,DEVICE,STATE", "connection", "show", "--active"])?;
            if let Some(device) = parse_activated_device(&out, ssid) {
                return Ok(device);
            }
            if Instant::now() >= deadline {
                return Err(BackendError::Timeout(format!("activation of '{ssid}'")));
            }
            thread::sleep(ACTIVATION_POLL);
        }
    }

    /// Resolve the IPv4 address assigned to a profile. `None` means it could
    /// not be determined, which callers report as "unknown".
    fn profile_ip(&self, name: &str) -> Option<String> {
        self.nmcli(&["-t", "-f", "IP4.ADDRESS", "connection", "show", name])
            .ok()
            .and_then(|out| parse_ip_address(&out))
    }

    fn device_signal(&self, device: &str, ssid: &str) -> Option<u8> {
        self.nmcli(&[
            "-t", "-f", "SIGNAL", "device", "wifi", "list", "ifname", device, "ssid", ssid,
        ])
        .ok()
        .and_then(|out| parse_signal(&out))
    }

    fn try_connect(&self, ssid: &str, password: Option<&str>) -> Result<ConnectionResult, BackendError> {
        if self.profile_exists(ssid)? {
            debug!(ssid, "saved profile exists, updating and activating");
            if let Some(pw) = password {
                self.nmcli(&["connection", "modify", ssid, "wifi-sec.psk", pw])?;
            }
            self.nmcli(&["connection", "up", ssid])?;
        } else {
            debug!(ssid, "no saved profile, creating one");
            match password {
                Some(pw) => self.nmcli(&["device", "wifi", "connect", ssid, "password", pw])?,
                None => self.nmcli(&["device", "wifi", "connect", ssid])?,
            };
        }

        let device = self.wait_for_activation(ssid)?;
        let ip_address = self.profile_ip(ssid);
        let signal_strength = self.device_signal(&device, ssid);
        info!(
            ssid,
            ip = ip_address.as_deref().unwrap_or("unknown"),
            "connection activated"
        );
        Ok(ConnectionResult::connected(ssid, ip_address, signal_strength))
    }
}

impl NetworkBackend for NmcliBackend {
    fn scan(&self) -> Result<Vec<NetworkRecord>, BackendError> {
        let out = match self.nmcli(&[
            "-t", "-f", "SSID,SIGNAL,SECURITY", "device", "wifi", "list", "--rescan", "yes",
        ]) {
            Ok(out) => out,
            // A busy or absent radio is an empty scan, not a fault.
            Err(BackendError::CommandFailed(diag)) => {
                warn!(%diag, "wifi list failed, returning empty scan");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };
        Ok(parse_scan(&out, &self.ap_ssid))
    }

    fn connect(&self, ssid: &str, password: Option<&str>) -> ConnectionResult {
        info!(ssid, "attempting connection");
        match self.try_connect(ssid, password) {
            Ok(result) => result,
            Err(err) => {
                let reason = failure_reason_for(&err);
                warn!(ssid, error = %err, "connection attempt failed");
                ConnectionResult::failed(ssid, reason)
            }
        }
    }

    fn disconnect(&self, ssid: &str) -> Result<(), BackendError> {
        match self.nmcli(&["connection", "down", ssid]) {
            Ok(_) => Ok(()),
            // Taking down a connection that is not up is not an error.
            Err(BackendError::CommandFailed(diag)) if diag.contains("not an active connection") => {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn active_connection(&self) -> Result<Option<ActiveConnectionInfo>, BackendError> {
        let out = self.nmcli(&["-t", "-f", "NAME,TYPE,DEVICE,STATE", "connection", "show", "--active"])?;
        Ok(parse_active_wireless(&out).map(|(ssid, device)| {
            let ip_address = self.profile_ip(&ssid);
            let signal_strength = self.device_signal(&device, &ssid);
            ActiveConnectionInfo {
                ssid,
                ip_address,
                signal_strength,
                device,
            }
        }))
    }

    fn saved_profiles(&self, excluding: &[String]) -> Result<Vec<String>, BackendError> {
        let out = self.nmcli(&["-t", "-f", "NAME,TYPE", "connection", "show"])?;
        Ok(parse_saved_profiles(&out, excluding))
    }

    fn activate_access_point(&self, config: &PortalConfig) -> Result<(), BackendError> {
        if self.profile_exists(&config.ap_ssid)? {
            info!(ssid = %config.ap_ssid, "AP profile exists, activating");
        } else {
            info!(ssid = %config.ap_ssid, "creating AP profile");
            let cidr = config.gateway_cidr();
            self.nmcli(&[
                "connection", "add",
                "type", "wifi",
                "ifname", &config.interface,
                "con-name", &config.ap_ssid,
                "autoconnect", "yes",
                "ssid", &config.ap_ssid,
                "mode", "ap",
                "ipv4.method", "shared",
                "ipv4.addresses", &cidr,
                "wifi-sec.key-mgmt", "wpa-psk",
                "wifi-sec.psk", &config.ap_passphrase,
            ])?;
        }
        self.nmcli(&["connection", "up", &config.ap_ssid])?;
        Ok(())
    }
}

/// Run an external command with a hard upper bound on its runtime. The
/// child is killed once the bound passes, so a hung tool surfaces as a
/// `Timeout` instead of blocking its caller indefinitely.
pub(crate) fn run_bounded(
    program: &str,
    args: &[&str],
    input: Option<&str>,
    timeout: Duration,
) -> Result<Output, BackendError> {
    let mut command = Command::new(program);
    command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
    command.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = command
        .spawn()
        .map_err(|e| BackendError::Unavailable(format!("{program}: {e}")))?;

    if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
        if let Err(e) = stdin.write_all(input.as_bytes()) {
            // A child that exits without draining its stdin breaks the pipe;
            // reap it here so the error path never leaks a zombie.
            let _ = child.kill();
            let _ = child.wait();
            return Err(BackendError::CommandFailed(format!("{program} stdin: {e}")));
        }
    }

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(BackendError::Timeout(format!(
                        "{program} {}",
                        args.join(" ")
                    )));
                }
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(BackendError::CommandFailed(format!("{program}: {e}"))),
        }
    }

    child
        .wait_with_output()
        .map_err(|e| BackendError::CommandFailed(format!("{program}: {e}")))
}

/// Decode captured stdout. Parsers downstream index into fields by byte
/// position, so undecodable bytes are rejected here rather than replaced.
fn decode_output(bytes: Vec<u8>) -> Result<String, BackendError> {
    String::from_utf8(bytes)
        .map_err(|e| BackendError::Parse(format!("invalid utf-8 in command output: {e}")))
}

/// Map an adapter-level error onto the reason reported to callers.
fn failure_reason_for(err: &BackendError) -> FailureReason {
    match err {
        BackendError::Unavailable(_) => FailureReason::BackendUnavailable,
        BackendError::Timeout(_) => FailureReason::Timeout,
        // nmcli signals a rejected WPA passphrase with this phrase on stderr.
        BackendError::CommandFailed(diag) if diag.contains("Secrets were required") => {
            FailureReason::AuthenticationFailed
        }
        BackendError::CommandFailed(_) | BackendError::Parse(_) => FailureReason::CommandFailed,
    }
}

/// Parse `nmcli -t -f SSID,SIGNAL,SECURITY device wifi list` output.
/// Malformed or short lines are skipped, duplicates collapse to the first
/// occurrence, and the device's own AP SSID is excluded.
fn parse_scan(output: &str, own_ssid: &str) -> Vec<NetworkRecord> {
    let mut seen = HashSet::new();
    let mut records = Vec::new();

    for line in output.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() < 3 {
            continue;
        }

        let ssid = parts[0];
        if ssid.is_empty() || ssid == own_ssid || !seen.insert(ssid.to_string()) {
            continue;
        }

        let signal: u8 = parts[1].parse().unwrap_or(0);
        // The SECURITY field may itself contain colons ("WPA1 WPA2:802.1X").
        let security = parse_security(&parts[2..].join(":"));

        records.push(NetworkRecord {
            ssid: ssid.to_string(),
            signal,
            security,
        });
    }

    records
}

fn parse_security(field: &str) -> Vec<Security> {
    let mut kinds = Vec::new();
    if field.contains("WPA2") {
        kinds.push(Security::Wpa2);
    }
    if field.contains("WPA1") {
        kinds.push(Security::Wpa);
    }
    if field.contains("WEP") {
        kinds.push(Security::Wep);
    }
    let trimmed = field.trim();
    if kinds.is_empty() && (trimmed.is_empty() || trimmed == "--") {
        kinds.push(Security::Open);
    }
    kinds
}

/// Device on which `ssid` is activated, from
/// `nmcli -t -f NAME,DEVICE,STATE connection show --active`.
fn parse_activated_device(output: &str, ssid: &str) -> Option<String> {
    for line in output.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() >= 3 && parts[0] == ssid && parts[2] == "activated" {
            return Some(parts[1].to_string());
        }
    }
    None
}

/// First activated wireless row of
/// `nmcli -t -f NAME,TYPE,DEVICE,STATE connection show --active`,
/// as (profile name, device).
fn parse_active_wireless(output: &str) -> Option<(String, String)> {
    for line in output.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() >= 4 && parts[1] == "802-11-wireless" && parts[3] == "activated" {
            return Some((parts[0].to_string(), parts[2].to_string()));
        }
    }
    None
}

fn parse_saved_profiles(output: &str, excluding: &[String]) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(':').collect();
            if parts.len() >= 2
                && parts[1] == "802-11-wireless"
                && !excluding.iter().any(|e| e == parts[0])
            {
                Some(parts[0].to_string())
            } else {
                None
            }
        })
        .collect()
}

/// Extract the address from lines like "IP4.ADDRESS[1]:10.42.0.17/24".
fn parse_ip_address(output: &str) -> Option<String> {
    for line in output.lines() {
        if let Some((key, value)) = line.split_once(':') {
            if key.starts_with("IP4.ADDRESS") {
                let addr = value.split('/').next().unwrap_or(value).trim();
                if !addr.is_empty() && addr != "--" {
                    return Some(addr.to_string());
                }
            }
        }
    }
    None
}

fn parse_signal(output: &str) -> Option<u8> {
    output.lines().find_map(|line| line.trim().parse().ok())
}
