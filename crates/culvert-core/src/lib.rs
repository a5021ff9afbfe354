//! Core building blocks for the culvert data plane.
//!
//! Module hierarchy:
//!   channel/ - one-packet-in-flight push channel with done signalling
//!   frame/   - secure datagram frame layout and MTU arithmetic
//!   crypto/  - CBC cipher wrapper, digest modes, constant-time compare

pub mod channel;
pub mod crypto;
pub mod frame;
