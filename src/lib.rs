//! HytaleGuard is a supervisor engine for local Hytale server processes.
//!
//! It launches one or more `HytaleServer.jar` processes (one per profile),
//! streams and classifies their console output, tracks connected players
//! from join/leave lines, and drives the device-code authentication flow the
//! server prints into its log: detected codes open the verification page,
//! and a successful login is persisted back into the originating server.

pub mod auth;
pub mod command;
pub mod config;
pub mod error;
pub mod instance;
pub mod parser;
pub mod platform;
pub mod server;

pub use auth::{AuthCoordinator, AuthSession, AuthSource, AuthState, auth_coordinator};
pub use config::{AuthMode, ServerConfig};
pub use instance::{InstanceStats, Listeners, ServerInstance, ServerStatus};
pub use server::Supervisor;
