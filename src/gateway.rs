//! Portal request gateway.
//!
//! The boundary between the web front end and the connection machinery. A
//! connect request from the portal page goes through the same backend the
//! supervisor uses and serializes on the same state mutex, so a
//! user-initiated connect and a background recovery attempt can never
//! mutate radio state at the same time.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::access_point::{AccessPointController, Restore};
use crate::backend::{ConnectionResult, NetworkBackend};
use crate::supervisor::SupervisorState;

pub struct PortalGateway {
    backend: Arc<dyn NetworkBackend>,
    controller: Arc<AccessPointController>,
    state: Arc<Mutex<SupervisorState>>,
}

impl PortalGateway {
    pub fn new(
        backend: Arc<dyn NetworkBackend>,
        controller: Arc<AccessPointController>,
        state: Arc<Mutex<SupervisorState>>,
    ) -> Self {
        PortalGateway {
            backend,
            controller,
            state,
        }
    }

    /// Connect to `ssid` on behalf of a portal user.
    ///
    /// Holds the shared connection lock for the whole transition, including
    /// the post-success restore, so concurrent requests (and the
    /// supervisor) execute strictly one after another. Only a successful
    /// connect tears down the captive redirection; on failure the previous
    /// state is reinstated and the portal keeps serving.
    pub fn request_connect(&self, ssid: &str, password: Option<&str>) -> ConnectionResult {
        let mut state = self.state.lock().unwrap();
        let previous = *state;
        *state = SupervisorState::Transitioning;
        info!(ssid, "portal connect request");

        let result = self.backend.connect(ssid, password);

        if result.success {
            *state = SupervisorState::ClientConnected;
            info!(ssid, "portal connect succeeded, lifting captive redirection");
            if self.controller.restore() == Restore::NothingToRestore {
                debug!("no captive redirection was in place");
            }
        } else {
            *state = previous;
            warn!(ssid, reason = ?result.failure_reason, "portal connect failed");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::access_point::testing::test_controller;
    use crate::backend::testing::FakeBackend;
    use crate::backend::FailureReason;
    use crate::config::PortalConfig;

    fn gateway_with(
        backend: FakeBackend,
        dir: &std::path::Path,
    ) -> (Arc<PortalGateway>, Arc<FakeBackend>, Arc<Mutex<SupervisorState>>) {
        let config = PortalConfig::default();
        let (controller, _runner) = test_controller(config, dir);
        let backend = Arc::new(backend);
        let state = Arc::new(Mutex::new(SupervisorState::ApActive));
        let gateway = PortalGateway::new(
            Arc::clone(&backend) as Arc<dyn NetworkBackend>,
            Arc::new(controller),
            Arc::clone(&state),
        );
        (Arc::new(gateway), backend, state)
    }

    #[test]
    fn invalid_password_is_reported_distinctly() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FakeBackend::new(&[], &[]);
        backend.failure = FailureReason::AuthenticationFailed;
        let (gateway, _backend, state) = gateway_with(backend, dir.path());

        let result = gateway.request_connect("Guest", Some("wrong"));
        assert!(!result.success);
        assert_eq!(result.failure_reason, Some(FailureReason::AuthenticationFailed));
        // The previous mode is reinstated; a failed request never strands
        // the device in Transitioning.
        assert_eq!(*state.lock().unwrap(), SupervisorState::ApActive);
    }

    #[test]
    fn successful_connect_restores_pre_portal_config() {
        let dir = tempfile::tempdir().unwrap();

        // Simulate an earlier apply(): a snapshot exists and the live
        // config is the portal's.
        fs::write(dir.path().join("dnsmasq.conf"), "portal config\n").unwrap();
        fs::write(dir.path().join("dnsmasq.conf.original"), "operator config\n").unwrap();

        let (gateway, backend, state) = gateway_with(FakeBackend::new(&[], &["Home"]), dir.path());

        let result = gateway.request_connect("Home", Some("pw"));
        assert!(result.success);
        assert_eq!(result.ip_address.as_deref(), Some("10.0.0.7"));
        assert_eq!(*state.lock().unwrap(), SupervisorState::ClientConnected);
        assert_eq!(backend.attempts(), ["Home"]);
        assert_eq!(
            fs::read_to_string(dir.path().join("dnsmasq.conf")).unwrap(),
            "operator config\n"
        );
    }

    #[test]
    fn success_without_prior_apply_is_still_success() {
        let dir = tempfile::tempdir().unwrap();
        let (gateway, _backend, _state) = gateway_with(FakeBackend::new(&[], &["Home"]), dir.path());

        // No snapshot exists; restore() is a defined no-op and the connect
        // result is unaffected.
        let result = gateway.request_connect("Home", None);
        assert!(result.success);
    }

    #[test]
    fn gateway_and_supervisor_never_mutate_concurrently() {
        use crate::supervisor::Supervisor;

        let dir = tempfile::tempdir().unwrap();
        let config = PortalConfig::default();
        let (controller, _runner) = test_controller(config.clone(), dir.path());
        let controller = Arc::new(controller);

        // "Home" is a saved profile the supervisor will try; "Guest" is what
        // the portal user asks for. Both connects succeed but take a while,
        // and FakeBackend panics if two attempts ever overlap.
        let mut backend = FakeBackend::new(&["Home"], &["Home", "Guest"]);
        backend.connect_delay = Duration::from_millis(50);
        let backend = Arc::new(backend);
        let state = Arc::new(Mutex::new(SupervisorState::ClientDisconnected));

        let supervisor = Arc::new(
            Supervisor::new(
                Arc::clone(&backend) as Arc<dyn NetworkBackend>,
                Arc::clone(&controller),
                Arc::clone(&state),
                config,
            )
            .without_upstream_probe(),
        );
        let gateway = Arc::new(PortalGateway::new(
            Arc::clone(&backend) as Arc<dyn NetworkBackend>,
            controller,
            Arc::clone(&state),
        ));

        let monitor = {
            let supervisor = Arc::clone(&supervisor);
            thread::spawn(move || supervisor.run_cycle())
        };
        let request = {
            let gateway = Arc::clone(&gateway);
            thread::spawn(move || gateway.request_connect("Guest", Some("pw1")))
        };

        monitor.join().unwrap();
        assert!(request.join().unwrap().success);
        // Depending on who wins the race the supervisor may find itself
        // already connected and skip its own attempt, but attempts never
        // overlapped (FakeBackend panics on interleaving) and both paths
        // agree on the final state.
        assert!(!backend.attempts().is_empty());
        assert_eq!(*state.lock().unwrap(), SupervisorState::ClientConnected);
    }

    #[test]
    fn concurrent_requests_serialize_on_the_connection_lock() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FakeBackend::new(&[], &["Guest", "Office"]);
        // Widen the race window; FakeBackend::connect panics if two
        // attempts overlap.
        backend.connect_delay = Duration::from_millis(50);
        let (gateway, backend, _state) = gateway_with(backend, dir.path());

        let first = {
            let gateway = Arc::clone(&gateway);
            thread::spawn(move || gateway.request_connect("Guest", Some("pw1")))
        };
        let second = {
            let gateway = Arc::clone(&gateway);
            thread::spawn(move || gateway.request_connect("Office", Some("pw2")))
        };

        assert!(first.join().unwrap().success);
        assert!(second.join().unwrap().success);
        assert_eq!(backend.attempts().len(), 2);
    }
}
