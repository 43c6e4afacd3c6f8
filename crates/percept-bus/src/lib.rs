//! `percept-bus` – typed, topic-based publish/subscribe frame transport.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.  Image lanes default to a queue depth of 1: only the newest
//! frame matters, and a receiver that falls behind skips straight to it.
//!
//! Unlike a plain broadcast channel, every lane also tracks its **demand** –
//! the number of live subscribers – through a [`tokio::sync::watch`] channel.
//! Publishers can read the count at any time
//! ([`FrameBus::subscriber_count`]) and react to every change
//! ([`FrameBus::demand_watch`]).  This is what lets the rectification
//! controller connect to its upstream camera only while someone is actually
//! listening downstream.

pub mod bus;

pub use bus::{FrameBus, FrameReceiver, ProcessTimeReceiver, Topic};
