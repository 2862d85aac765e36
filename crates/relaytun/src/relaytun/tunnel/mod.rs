//! Relay tunneling core: frames, relay sessions with resumable delivery, local loopback
//! endpoints and the broker that ties a target to one of each.

pub mod broker;
pub mod buffer;
pub mod client;
pub mod connection;
pub mod credential;
pub mod error;
pub mod listener;
pub mod policy;
pub mod protocol;
pub mod session;
pub mod target;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
