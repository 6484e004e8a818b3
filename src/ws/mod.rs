//! WebSocket layer: connection lifecycle, frame dispatch, supervision.
//!
//! Two endpoints share one implementation. `/ws` attaches a socket to every
//! trip the caller is an active member of; `/trips/{trip_id}/ws/events`
//! binds it to a single trip.

pub mod connection;
pub mod dispatch;
pub mod handler;
pub mod messages;
pub mod supervisor;

pub use connection::{CloseReason, Connection, ConnectionScope, ConnectionState};
pub use supervisor::ConnectionSupervisor;
