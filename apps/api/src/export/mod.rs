pub mod handlers;
pub mod renderer;
pub mod service;
pub mod token;
