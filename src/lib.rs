//! Diameter base protocol (RFC 6733) stack.
//!
//! This crate provides three layers:
//! - a bit-exact codec for Diameter messages and AVPs, including grouped
//!   AVPs and vendor extensions ([`avp`], [`message`], [`dictionary`]);
//! - a peer connection state machine driving capabilities exchange
//!   (CER/CEA), watchdog keep-alive (DWR/DWA) and orderly disconnect
//!   (DPR/DPA) over TCP or SCTP ([`peer`], [`transport`]);
//! - a node that multiplexes many peer connections, routes requests to
//!   registered applications and correlates requests with answers
//!   ([`node`], [`application`]).
//!
//! Base protocol messages never surface to applications; anything else is
//! routed by application id and realm, with least-loaded peer selection.

pub mod application;
pub mod avp;
pub mod common;
pub mod config;
pub mod dictionary;
pub mod error;
pub mod message;
pub mod node;
pub mod peer;
pub mod session;
pub mod stats;
pub mod transport;
pub mod uri;

pub use application::Application;
pub use avp::{Avp, AvpValue};
pub use config::{NodeConfig, PeerSettings, TimerConfig};
pub use error::{DiameterError, DiameterResult, ResultCode};
pub use message::{DiameterHeader, DiameterMessage};
pub use node::{Node, NodeHandle, PeerStatus};
pub use peer::{Direction, DisconnectReason, PeerState};
pub use stats::{NodeStats, StatsSnapshot};
pub use transport::TransportKind;
pub use uri::DiameterUri;

/// Diameter protocol version.
pub const DIAMETER_VERSION: u8 = 1;

/// Default Diameter port.
pub const DIAMETER_PORT: u16 = 3868;

/// Default Diameter secure transport port (out of scope here, recognized
/// by the URI parser only).
pub const DIAMETER_TLS_PORT: u16 = 5658;
