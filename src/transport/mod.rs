//! Module B — Fast-Path Transport. A local-stream duplex endpoint with
//! reconnect, correlation, and backpressure (spec.md §4.B). See
//! [`client::TransportClient`] for the producer side and
//! [`server::TransportServer`] for the core's listener side.

pub mod client;
pub mod server;

pub use client::{ConnectionState, TransportClient, TransportClientConfig};
pub use server::{FrameHandler, TransportServer};
