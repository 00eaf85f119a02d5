//! Spindle server
//!
//! The HTTP(S) front-end of the Spindle load balancer: configuration
//! loading and validation, the dispatcher that forwards client requests
//! through a `spindle-core` selection policy, the dynamic-registration
//! endpoints backends announce themselves on, the active health monitor,
//! and TLS termination (local PEM files or ACME).

pub mod config;
pub mod health;
pub mod registration;
pub mod server;
pub mod textformat;
pub mod tls;

pub use config::{Config, ConfigError, ConfigFormat};
pub use health::{DeadCounter, HealthMonitor};
pub use server::{Server, ServerError};
