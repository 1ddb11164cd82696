//! Shared test utilities for the tunnel workspace's integration suite.

pub mod handshake_builder;
pub mod mock_echo_server;

pub use handshake_builder::build_handshake_frame;
pub use mock_echo_server::MockEchoServer;
