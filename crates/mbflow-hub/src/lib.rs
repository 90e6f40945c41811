//! WebSocket hub.
//!
//! Multiplexes live execution events to connected clients. Each client has a
//! bounded send queue (overflow closes the client), an optional execution-id
//! scope, and a subscription set of event types (empty means all). The
//! [`HubObserver`] bridges the engine's observer bus into the hub; the axum
//! handler in [`ws`] pumps a client's queue over an upgraded socket.

mod hub;
mod observer;
mod wire;
pub mod ws;

pub use hub::{Hub, HubClient};
pub use observer::HubObserver;
pub use wire::{ClientCommand, WireMessage};
