//! A transparent TCP relay.
//!
//! Every client accepted on the local endpoint is paired with a fresh
//! connection to one fixed upstream endpoint, and bytes are copied in both
//! directions until either side closes.

pub mod config;
pub mod forwarder;
pub mod listener;
pub mod pair;
pub mod relay_set;
pub mod signals;
pub mod supervisor;
pub mod trace;

pub use tcprelay_model::Endpoint;
