pub mod cli;
pub mod clustering;
pub mod config;
pub mod constants;
pub mod error;
pub mod paths;
pub mod server;
pub mod services;
