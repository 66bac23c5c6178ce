pub mod config;
pub mod core;
pub mod interfaces;
pub mod logging;
pub mod sources;
