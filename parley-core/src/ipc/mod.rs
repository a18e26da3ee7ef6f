//! Types that leave the core: broadcast events and the listener callbacks.
//!
//! Events derive `serde::Serialize` + `serde::Deserialize` so a host process
//! can forward them verbatim as JSON.

pub mod events;
pub mod listener;
