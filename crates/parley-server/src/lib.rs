//! # parley-server
//!
//! TCP relay for the Parley chat protocol.
//!
//! - **Listener** accepts connections and admits them against the
//!   blacklist and the connection limit
//! - **Session** runs one client through authentication and relays what
//!   it sends
//! - **Room registry** tracks the public room, pairwise private rooms, and
//!   routes broadcasts
//! - **Admin API** (axum) for health checks, session listing, kicks,
//!   blacklist management and shutdown

pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod listener;
pub mod rooms;
pub mod session;
pub mod transport;

pub use config::ServerConfig;
pub use context::ServerContext;
pub use error::ServerError;
pub use listener::Listener;
