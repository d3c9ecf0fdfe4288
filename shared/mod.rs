pub mod config;
pub mod files;
pub mod progress;
pub mod tasks;
