// Export all necessary modules
pub mod aggregator;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod indicators;
pub mod models;
pub mod processor;
pub mod stream;
pub mod utils;
