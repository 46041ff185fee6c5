pub mod api;
pub mod app;
pub mod compositor;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod pool;
pub mod spsc;
pub mod thumb;
