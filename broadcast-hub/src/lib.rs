//! Real-time fan-out hub: every payload a participant sends is relayed to
//! every connected participant.
//!
//! - [`hub`] owns the membership set in a single task and serializes join,
//!   leave and broadcast requests against each other.
//! - [`session`] is the connection adapter: it joins, relays inbound
//!   payloads, drains the participant's mailbox and leaves exactly once.
//! - [`frame`] provides newline-delimited byte framing for raw streams.
//! - [`tcp`] and [`web`] are the transports (raw TCP and HTTP/WebSocket).
//! - [`cli`] parses the command line; [`client`] is a terminal client for
//!   the TCP transport.

pub mod cli;
pub mod client;
pub mod frame;
pub mod hub;
pub mod session;
pub mod tcp;
pub mod web;
