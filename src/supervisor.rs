//! Connectivity supervisor.
//!
//! The state machine that keeps the device reachable: while a known network
//! is joinable the device stays a client, otherwise it falls back to
//! advertising its own access point with the captive portal behind it. Runs
//! as a single long-lived task with per-state wake intervals; every fault
//! inside a poll cycle is absorbed and logged, never fatal to the loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::access_point::AccessPointController;
use crate::backend::NetworkBackend;
use crate::config::PortalConfig;

/// Mode the device is currently in. One process-wide instance lives in an
/// `Arc<Mutex<SupervisorState>>` shared with the portal gateway; that mutex
/// is also the advisory lock serializing every mutation of radio/connection
/// state, so the two paths can never interleave a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    ClientConnected,
    ClientDisconnected,
    ApActive,
    /// Held only for the duration of a transition attempt.
    Transitioning,
}

/// Wake interval while a client link or the AP is healthy and steady.
pub const CONNECTED_POLL: Duration = Duration::from_secs(60);

/// Long backoff after falling back to AP mode, so the device does not
/// thrash between AP and client mode while every saved network is down.
pub const AP_BACKOFF: Duration = Duration::from_secs(300);

/// Moderate interval after a failed transition or an absorbed error.
pub const RETRY_POLL: Duration = Duration::from_secs(60);

/// Probe target for the advisory upstream check. A 204 endpoint so a plain
/// 200-with-body from an interception box still counts as "reachable".
const UPSTREAM_PROBE_URL: &str = "http://connectivity-check.ubuntu.com";

pub struct Supervisor {
    backend: Arc<dyn NetworkBackend>,
    controller: Arc<AccessPointController>,
    state: Arc<Mutex<SupervisorState>>,
    config: PortalConfig,
    probe_upstream: bool,
}

impl Supervisor {
    pub fn new(
        backend: Arc<dyn NetworkBackend>,
        controller: Arc<AccessPointController>,
        state: Arc<Mutex<SupervisorState>>,
        config: PortalConfig,
    ) -> Self {
        Supervisor {
            backend,
            controller,
            state,
            config,
            probe_upstream: true,
        }
    }

    /// Disable the outbound reachability probe (tests, air-gapped installs).
    pub fn without_upstream_probe(mut self) -> Self {
        self.probe_upstream = false;
        self
    }

    /// One pass of the transition algorithm. Returns how long to sleep
    /// before the next pass. Never panics on backend faults; they are
    /// logged and treated as "not connected" or "try again later".
    pub fn run_cycle(&self) -> Duration {
        // 1. Are we a client on some network other than our own AP?
        match self.backend.active_connection() {
            Ok(Some(active)) if active.ssid != self.config.ap_ssid => {
                *self.state.lock().unwrap() = SupervisorState::ClientConnected;
                debug!(ssid = %active.ssid, "client link is up");
                if self.probe_upstream && !upstream_reachable() {
                    // Advisory only: a captive or local-only network is
                    // still a valid client state.
                    warn!(ssid = %active.ssid, "client link is up but upstream is unreachable");
                }
                return CONNECTED_POLL;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "connectivity query failed, treating as disconnected");
            }
        }

        *self.state.lock().unwrap() = SupervisorState::ClientDisconnected;

        // 2. Try every saved profile, in backend order, stopping at the
        //    first that comes up. The connect call embeds the bounded
        //    settle wait.
        let excluding = [self.config.ap_ssid.clone()];
        let profiles = match self.backend.saved_profiles(&excluding) {
            Ok(profiles) => profiles,
            Err(err) => {
                warn!(error = %err, "could not enumerate saved profiles");
                Vec::new()
            }
        };
        info!(count = profiles.len(), "not connected, attempting saved profiles");

        for profile in &profiles {
            let mut state = self.state.lock().unwrap();
            *state = SupervisorState::Transitioning;
            let result = self.backend.connect(profile, None);
            if result.success {
                *state = SupervisorState::ClientConnected;
                info!(ssid = %profile, "reconnected via saved profile");
                return CONNECTED_POLL;
            }
            *state = SupervisorState::ClientDisconnected;
            drop(state);
            debug!(ssid = %profile, "saved profile did not come up");
        }

        // 3. Nothing joinable: become the access point.
        info!("no saved network reachable, falling back to access point mode");
        let mut state = self.state.lock().unwrap();
        *state = SupervisorState::Transitioning;

        let activated = match self.backend.activate_access_point(&self.config) {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "failed to activate access point profile");
                false
            }
        };

        if activated && self.controller.apply() {
            *state = SupervisorState::ApActive;
            info!("access point active, backing off before retrying client mode");
            AP_BACKOFF
        } else {
            // Degraded: do not claim AP_ACTIVE for a half-working AP; stay
            // disconnected so the next cycle retries the whole transition.
            *state = SupervisorState::ClientDisconnected;
            RETRY_POLL
        }
    }

    /// Drive [`run_cycle`](Self::run_cycle) until shutdown. The first cycle
    /// runs immediately, which also establishes the correct startup state
    /// (connected if a prior client link survives, disconnected otherwise).
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("connectivity supervisor started");
        loop {
            let supervisor = Arc::clone(&self);
            let interval = match tokio::task::spawn_blocking(move || supervisor.run_cycle()).await {
                Ok(interval) => interval,
                Err(err) => {
                    error!(error = %err, "supervisor cycle aborted");
                    RETRY_POLL
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("connectivity supervisor stopped");
    }
}

/// Best-effort upstream reachability check with a hard 2 s bound.
pub fn upstream_reachable() -> bool {
    ureq::get(UPSTREAM_PROBE_URL)
        .timeout(Duration::from_secs(2))
        .call()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_point::testing::{test_controller, RecordingRunner};
    use crate::backend::testing::FakeBackend;

    fn supervisor_with(
        backend: FakeBackend,
    ) -> (Arc<Supervisor>, Arc<Mutex<SupervisorState>>, RecordingRunner, tempfile::TempDir) {
        let config = PortalConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let (controller, runner) = test_controller(config.clone(), dir.path());
        let state = Arc::new(Mutex::new(SupervisorState::ClientDisconnected));
        let supervisor = Supervisor::new(
            Arc::new(backend),
            Arc::new(controller),
            Arc::clone(&state),
            config,
        )
        .without_upstream_probe();
        (Arc::new(supervisor), state, runner, dir)
    }

    #[test]
    fn connected_client_stays_connected() {
        let backend = FakeBackend::new(&[], &[]).with_active("CoffeeShop");
        let fake = Arc::new(backend);
        let config = PortalConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let (controller, runner) = test_controller(config.clone(), dir.path());
        let state = Arc::new(Mutex::new(SupervisorState::ClientDisconnected));
        let supervisor = Supervisor::new(
            Arc::clone(&fake) as Arc<dyn NetworkBackend>,
            Arc::new(controller),
            Arc::clone(&state),
            config,
        )
        .without_upstream_probe();

        assert_eq!(supervisor.run_cycle(), CONNECTED_POLL);
        assert_eq!(*state.lock().unwrap(), SupervisorState::ClientConnected);
        assert!(fake.attempts().is_empty());
        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn saved_profiles_tried_in_order_until_one_succeeds() {
        let backend = FakeBackend::new(&["Home", "Office"], &["Office"]);
        let fake = Arc::new(backend);
        let config = PortalConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let (controller, _runner) = test_controller(config.clone(), dir.path());
        let state = Arc::new(Mutex::new(SupervisorState::ClientDisconnected));
        let supervisor = Supervisor::new(
            Arc::clone(&fake) as Arc<dyn NetworkBackend>,
            Arc::new(controller),
            Arc::clone(&state),
            config,
        )
        .without_upstream_probe();

        assert_eq!(supervisor.run_cycle(), CONNECTED_POLL);
        assert_eq!(*state.lock().unwrap(), SupervisorState::ClientConnected);
        assert_eq!(fake.attempts(), ["Home", "Office"]);
        assert_eq!(
            fake.active.lock().unwrap().as_ref().unwrap().ssid,
            "Office"
        );
    }

    #[test]
    fn no_profiles_falls_back_to_access_point() {
        let (supervisor, state, runner, _dir) = supervisor_with(FakeBackend::new(&[], &[]));

        assert_eq!(supervisor.run_cycle(), AP_BACKOFF);
        assert_eq!(*state.lock().unwrap(), SupervisorState::ApActive);
        // AP provisioning happened exactly once.
        assert_eq!(runner.count("iptables-restore"), 1);
        assert_eq!(runner.count("systemctl"), 1);
    }

    #[test]
    fn own_ap_profile_is_never_a_recovery_candidate() {
        let backend = FakeBackend::new(&["SetupPortal"], &["SetupPortal"]);
        let (supervisor, state, _runner, _dir) = supervisor_with(backend);

        // The only saved profile is the AP itself, so recovery must skip it
        // and fall back to AP mode.
        assert_eq!(supervisor.run_cycle(), AP_BACKOFF);
        assert_eq!(*state.lock().unwrap(), SupervisorState::ApActive);
    }

    #[test]
    fn active_ap_does_not_count_as_client_link() {
        let backend = FakeBackend::new(&[], &[]).with_active("SetupPortal");
        let (supervisor, state, _runner, _dir) = supervisor_with(backend);

        assert_eq!(supervisor.run_cycle(), AP_BACKOFF);
        assert_eq!(*state.lock().unwrap(), SupervisorState::ApActive);
    }

    #[test]
    fn failed_ap_provisioning_degrades_instead_of_claiming_success() {
        let backend = FakeBackend::new(&[], &[]);
        let fake = Arc::new(backend);
        let config = PortalConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let (controller, runner) = test_controller(config.clone(), dir.path());
        runner.fail_program("iptables-restore");
        let state = Arc::new(Mutex::new(SupervisorState::ClientDisconnected));
        let supervisor = Supervisor::new(
            Arc::clone(&fake) as Arc<dyn NetworkBackend>,
            Arc::new(controller),
            Arc::clone(&state),
            config,
        )
        .without_upstream_probe();

        assert_eq!(supervisor.run_cycle(), RETRY_POLL);
        assert_eq!(*state.lock().unwrap(), SupervisorState::ClientDisconnected);
    }
}
