pub mod auth;
pub mod public;
