//! frame-mux: a length-prefixed request/response server.
//!
//! Every message is a 4-byte length followed by up to 4096 bytes of payload.
//! A single thread multiplexes all client connections over a readiness
//! poller, answering pipelined requests in order.
//!
//! Layout:
//! - `runtime`: frame codec, connection state machine, event loop
//! - `service`: the request processing hook (echo by default)
//! - `client`: blocking client for the same framing
//! - `config`: CLI and TOML configuration

pub mod client;
pub mod config;
pub mod runtime;
pub mod service;
