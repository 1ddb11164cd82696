//! Preset implementations that plug into `tunnel_core::pipeline::Pipeline`.

pub mod exp_base_auth_stream;

pub use exp_base_auth_stream::ExpBaseAuthStream;
