//! Gateway: the HTTP + WebSocket surface of the relay.
//!
//! Subscribe mode:
//! - `GET|POST /sub/{channel}` trades Basic credentials for a one-shot ticket
//! - `GET /ws/sub?<ticket>` upgrades and starts the fanout for that channel
//! - `GET /list/{key}` reads back list history, via plugins or a plain slice
//! - `/refresh` reloads the identity table given the rotating token
//!
//! Publish mode serves `POST /pub/{id}` instead. Both serve `/health`.

pub mod auth;
pub mod connections;
pub mod error;
pub mod list;
pub mod publish;
pub mod server;
pub mod state;
pub mod tickets;
pub mod ws;

pub use {error::GatewayError, server::start_gateway};
