//! # RCON Proxy Library
//!
//! This library implements a protocol-aware reverse proxy that sits between
//! RCON clients and a game server's remote console listener. It relays bytes
//! in both directions unchanged, recovers the commands clients send for
//! telemetry, and paces traffic so the backend is never flooded.
//!
//! ## Core Responsibilities
//!
//! ### Transparent Relay
//! Every accepted client connection is paired with a freshly dialed backend
//! connection. Bytes read on one side are written to the other exactly as
//! read; inspection never alters the payload.
//!
//! ### Command Observation
//! The first chunk of a session is the XOR key. Later client chunks are
//! decoded against it and split into an upper-cased command and its
//! arguments, which are emitted as telemetry points tagged with the server
//! name.
//!
//! ### Backpressure
//! The backend's command queue is small and misbehaves under bursts,
//! especially while many clients log in at once. Each mapping therefore
//! spaces out both new connections and client-origin packets by a minimum
//! delay (10ms by default), across all of its sessions.
//!
//! ## Architecture Design
//!
//! ### Task Layout
//! One task per mapping accepts connections. Each session runs two tasks, one
//! per direction. Pacing releases run as short detached tasks so a sender
//! never waits for its own release.
//!
//! ### Session Teardown
//! Whichever direction stops first closes the session. The sibling's pending
//! read, gate wait or write is abandoned, both tasks return, and both
//! connections are dropped. Nothing about a session survives its sockets.
//!
//! ## Module Organization
//!
//! ### Config Module (`config`)
//! TOML configuration: mappings, pacing delays and the optional telemetry store.
//!
//! ### Pacing Module (`pacing`)
//! Capacity-one token buckets with delayed refill, one pair per mapping.
//!
//! ### Relay Module (`relay`)
//! Session state, the two copy loops and the cascade close.
//!
//! ### Listener Module (`listener`)
//! The per-mapping acceptor: bind, then accept under the admission gate.
//!
//! ### Orchestrator Module (`orchestrator`)
//! Starts all acceptors and closes telemetry exactly once on the way out.
//!
//! ### Telemetry Module (`telemetry`)
//! Observation type, sink trait and the batched InfluxDB writer.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use proxy::config::ProxyConfig;
//! use proxy::orchestrator::Orchestrator;
//! use proxy::telemetry::{BatchOptions, Emitter};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::load(Path::new("config.toml"))?;
//!     let emitter = Arc::new(Emitter::from_config(
//!         config.influxdb.as_ref(),
//!         BatchOptions::default(),
//!     )?);
//!
//!     let orchestrator = Orchestrator::new(config.mappings(), config.pacing.clone(), emitter);
//!     orchestrator
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod listener;
pub mod orchestrator;
pub mod pacing;
pub mod relay;
pub mod telemetry;
pub mod utils;
