pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod pipeline;
pub mod response;
pub mod server;
