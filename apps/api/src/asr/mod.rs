pub mod client;
pub mod handlers;
pub mod service;
