//! Captive-portal connectivity supervisor.
//!
//! Keeps a wireless-equipped device reachable: while no known network is
//! joinable the device advertises its own access point and serves a captive
//! portal for onboarding; as soon as a known network is reachable it joins
//! it as a client and lifts the portal redirection.
//!
//! # Modules
//!
//! - [`backend`] - Typed adapter over NetworkManager (scan, connect, AP activation)
//! - [`access_point`] - DNS/DHCP/firewall provisioning for AP mode
//! - [`supervisor`] - The state machine deciding between client and AP mode
//! - [`gateway`] - Connect requests from the portal page, serialized with the supervisor
//! - [`server`] - The portal HTTP surface (axum)
//! - [`config`] - Static portal configuration (subnet, SSID, ports)
//! - [`error`] - Backend error types
//!
//! # Example
//!
//! ```no_run
//! use std::sync::{Arc, Mutex};
//! use captive_portal::{
//!     access_point::AccessPointController,
//!     backend::{NetworkBackend, NmcliBackend},
//!     config::PortalConfig,
//!     supervisor::{Supervisor, SupervisorState},
//! };
//!
//! let config = PortalConfig::default();
//! let backend: Arc<dyn NetworkBackend> = Arc::new(NmcliBackend::new(config.ap_ssid.clone()));
//! let controller = Arc::new(AccessPointController::new(config.clone()));
//! let state = Arc::new(Mutex::new(SupervisorState::ClientDisconnected));
//! let supervisor = Supervisor::new(backend, controller, state, config);
//! let interval = supervisor.run_cycle();
//! println!("next poll in {interval:?}");
//! ```

pub mod access_point;
pub mod backend;
pub mod config;
pub mod error;
pub mod gateway;
pub mod server;
pub mod supervisor;

pub use access_point::{AccessPointController, Restore};
pub use backend::{
    ActiveConnectionInfo, ConnectionResult, FailureReason, NetworkBackend, NetworkRecord,
    NmcliBackend,
};
pub use config::PortalConfig;
pub use error::BackendError;
pub use gateway::PortalGateway;
pub use supervisor::{Supervisor, SupervisorState};
