pub mod broker;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod openai;
pub mod protocols;
pub mod routers;
pub mod server;
pub mod tasks;
