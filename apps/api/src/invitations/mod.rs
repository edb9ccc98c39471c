//! Invitation codes: minting, validation, single-use-per-user redemption, admin lifecycle.

pub mod code;
pub mod handlers;
pub mod registry;
