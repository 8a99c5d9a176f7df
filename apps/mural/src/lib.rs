pub mod app;
pub mod cli;
pub mod config;
pub mod identity;
pub mod relay;
pub mod session;
pub mod telemetry;
