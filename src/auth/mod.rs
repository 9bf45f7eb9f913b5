pub mod handshake;
pub mod tokens;
