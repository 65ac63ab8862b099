pub mod config;
pub mod congestion;
pub mod detect;
pub mod error;
pub mod frame;
pub mod hub;
pub mod pipeline;
pub mod render;
pub mod server;
pub mod signal;
pub mod snapshot;
pub mod source;
pub mod stats;
pub mod telemetry;
