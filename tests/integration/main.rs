//! Lodestone integration harness.
//!
//! Every test runs against in-process stub Bolt servers on real TCP
//! sockets: the stub accepts the handshake, then follows a per-connection
//! script of expected requests and canned responses. This exercises the
//! full production stack — TCP connector, chunked framing, PackStream,
//! pools, routing — with no external database.
//!
//!   RUST_LOG=lodestone_net=trace cargo test --test integration

mod harness;
mod pooling;
mod routing_flow;
