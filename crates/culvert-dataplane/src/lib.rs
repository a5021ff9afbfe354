//! Stateful halves of the culvert data plane.
//!
//! Module hierarchy:
//!   fairqueue/ - virtual-time weighted fair scheduler over packet flows
//!   decoder/   - inbound secure datagram pipeline with offloaded crypto
//!   otp/       - one-time password replay checker
//!   worker/    - offload wrapper around the runtime's blocking pool

pub mod decoder;
pub mod fairqueue;
pub mod otp;
pub mod worker;
