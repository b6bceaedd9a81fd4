pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod extractor;
pub mod models;
pub mod monitor;
pub mod queue;
pub mod renderer;
pub mod scheduler;
pub mod stealth;
pub mod worker;
