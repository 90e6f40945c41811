//! Observer bus for execution events.
//!
//! Observers receive events on their own bounded FIFO queue, so a slow
//! observer never delays the engine or any other observer. On overflow the
//! oldest queued event for that observer is dropped and counted. An observer
//! returning an error is logged and kept; an observer that panics is
//! unregistered.

mod bus;
mod observer;

pub use bus::ObserverBus;
pub use observer::{ChannelObserver, LogObserver, Observer, ObserverError};
